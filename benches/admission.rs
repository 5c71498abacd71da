//! Admission benchmarks: the per-request cost of pricing, ordering and the
//! ledger's decide-and-debit critical section.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

use economic_router::config::RouterConfig;
use economic_router::routing::{BudgetConfig, RouterTunables};
use economic_router::{EconomicRouter, RouteRequest, SystemClock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unlimited_router(caching: bool) -> EconomicRouter {
    let config = RouterConfig {
        budget: BudgetConfig {
            daily_ceiling_usd: f64::INFINITY,
            monthly_ceiling_usd: f64::INFINITY,
            ..BudgetConfig::default()
        },
        tunables: RouterTunables {
            caching_enabled: caching,
            ..RouterTunables::default()
        },
        ..RouterConfig::default()
    };
    EconomicRouter::from_config(&config, Arc::new(SystemClock)).expect("bench router")
}

// ---------------------------------------------------------------------------
// Bench: single-threaded admission per mode
// ---------------------------------------------------------------------------

fn bench_route_by_mode(c: &mut Criterion) {
    let router = unlimited_router(false);
    let mut group = c.benchmark_group("route_by_mode");
    for mode in ["cost_optimized", "balanced", "performance"] {
        let req = RouteRequest::new("Summarise the attached quarterly report in three bullets")
            .mode(mode);
        group.bench_with_input(BenchmarkId::from_parameter(mode), &req, |b, req| {
            b.iter(|| black_box(router.route(black_box(req)).is_ok()));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: cache hits vs. misses
// ---------------------------------------------------------------------------

fn bench_cache_hit(c: &mut Criterion) {
    let router = unlimited_router(true);
    let req = RouteRequest::new("What is the capital of France?");
    let _ = router.route(&req);
    c.bench_function("route_cache_hit", |b| {
        b.iter(|| black_box(router.route(black_box(&req)).is_ok()));
    });
}

// ---------------------------------------------------------------------------
// Bench: contended admission on one owner
// ---------------------------------------------------------------------------

fn bench_contended_owner(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let router = Arc::new(unlimited_router(false));

    let mut group = c.benchmark_group("contended_owner");
    for tasks in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let router = router.clone();
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|i| {
                            let router = router.clone();
                            tokio::spawn(async move {
                                router
                                    .route(&RouteRequest::new(format!("contended prompt {i}")))
                                    .is_ok()
                            })
                        })
                        .collect();
                    for h in handles {
                        black_box(h.await.unwrap_or(false));
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_route_by_mode,
    bench_cache_hit,
    bench_contended_owner
);
criterion_main!(benches);
