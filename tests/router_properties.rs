//! End-to-end routing properties
//!
//! Drives an [`EconomicRouter`] built from a [`RouterConfig`] and checks the
//! budget, mode and availability guarantees callers depend on:
//!
//! - ledger spend always equals the sum of admitted estimates
//! - unknown modes are refused with a typed error
//! - `local` keeps every mode serving when remote tiers are down
//! - expired periods come back with their full ceiling
//! - the $10/day, three $4 requests walk-throughs in each mode

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use economic_router::config::RouterConfig;
use economic_router::routing::{
    AlertLevel, BudgetConfig, DecisionReason, LatencyClass, LedgerEvent, Tier,
};
use economic_router::{
    EconomicMode, EconomicRouter, ManualClock, PeriodKind, RouteRequest, RouterError, TierId,
};
use tokio::sync::broadcast;

// ============================================================================
// Fixtures
// ============================================================================

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
        .single()
        .unwrap_or_else(|| std::panic::panic_any("test: fixed start time must exist"))
}

fn tier(id: TierId, output_cost_per_1k: f64, quality_rank: u8) -> Tier {
    Tier {
        id,
        input_cost_per_1k: 0.0,
        output_cost_per_1k,
        latency_class: LatencyClass::Standard,
        quality_rank,
        health_url: None,
        batch_discount: 0.0,
        enabled: true,
    }
}

fn config(tiers: Vec<Tier>, daily_ceiling_usd: f64) -> RouterConfig {
    RouterConfig {
        tiers,
        budget: BudgetConfig {
            daily_ceiling_usd,
            ..BudgetConfig::default()
        },
        ..RouterConfig::default()
    }
}

fn build(config: &RouterConfig) -> (EconomicRouter, ManualClock) {
    let clock = ManualClock::new(start());
    let router = EconomicRouter::from_config(config, Arc::new(clock.clone()))
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: router build failed: {e}")));
    (router, clock)
}

/// A local-only table where every request with 1 000 output tokens costs $4.
fn four_dollar_router() -> (EconomicRouter, ManualClock) {
    build(&config(vec![tier(TierId::Local, 4.0, 1)], 10.0))
}

/// One $4 request. Prompts differ so nothing is ever served from cache.
fn four_dollar_request(i: usize, mode: &str) -> RouteRequest {
    RouteRequest {
        output_tokens: Some(1000),
        ..RouteRequest::new(format!("request number {i}")).mode(mode)
    }
}

fn alerts(rx: &mut broadcast::Receiver<LedgerEvent>) -> Vec<(AlertLevel, PeriodKind)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LedgerEvent::Alert(alert) = event {
            out.push((alert.level, alert.period));
        }
    }
    out
}

const MICROS: u64 = 1_000_000;

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_spend_equals_sum_of_admitted_estimates() {
    let mut local = tier(TierId::Local, 0.5, 1);
    local.input_cost_per_1k = 1.0;
    let (router, _) = build(&config(vec![local], 10.0));

    let mut admitted = 0u64;
    let mut refused = 0;
    for i in 0..400 {
        let prompt = "x".repeat(500 + (i * 37) % 4000);
        let req = RouteRequest::new(prompt).mode("cost_optimized");
        match router.route(&req) {
            Ok(decision) => admitted += decision.estimated_cost_micros,
            Err(RouterError::BudgetExceeded { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
        let daily = router.ledger().current("default", PeriodKind::Daily);
        assert_eq!(daily.spent_micros, admitted);
        assert!(daily.spent_micros <= 10 * MICROS);
    }
    assert!(refused > 0, "the run must exhaust the budget");
    assert_eq!(
        router.ledger().current("default", PeriodKind::Monthly).spent_micros,
        admitted
    );
}

#[test]
fn test_unknown_modes_always_fail_with_invalid_mode() {
    let (router, _) = build(&RouterConfig::default());
    for bad in [
        "",
        "fast",
        "cheap",
        "Balanced",
        "PERFORMANCE",
        "cost-optimized",
        "cost_optimized ",
        "balanced\n",
        "🚀",
    ] {
        let result = router.route(&RouteRequest::new("hello").mode(bad));
        assert!(
            matches!(result, Err(RouterError::InvalidMode(ref m)) if m == bad),
            "mode {bad:?} gave {result:?}"
        );
    }
    assert_eq!(router.usage().rejected_invalid, 9);
    assert_eq!(router.usage().total_requests, 0);
}

#[test]
fn test_all_modes_fall_back_to_local_when_remote_tiers_are_down() {
    let (router, _) = build(&RouterConfig::default());
    router.report_tier_failure(TierId::Elastic);
    router.report_tier_failure(TierId::Premium);

    for mode in EconomicMode::ALL {
        for task in ["simple", "general", "complex"] {
            let req = RouteRequest::new(format!("{mode} {task} question"))
                .mode(mode.as_str())
                .task(task);
            let decision = router
                .route(&req)
                .unwrap_or_else(|e| panic!("{mode}/{task} failed: {e}"));
            assert_eq!(decision.tier, TierId::Local, "{mode}/{task}");
        }
    }
    assert_eq!(router.health().status, "degraded");
}

#[test]
fn test_expired_daily_period_returns_full_ceiling() {
    let (router, clock) = four_dollar_router();
    for i in 0..2 {
        assert!(router.route(&four_dollar_request(i, "cost_optimized")).is_ok());
    }
    assert_eq!(router.ledger().remaining("default", PeriodKind::Daily), 2 * MICROS);

    clock.advance(Duration::days(1));
    assert_eq!(router.ledger().remaining("default", PeriodKind::Daily), 10 * MICROS);
    // Monthly spend carries over inside the same month.
    assert_eq!(
        router.ledger().current("default", PeriodKind::Monthly).spent_micros,
        8 * MICROS
    );
    assert!(router.route(&four_dollar_request(9, "cost_optimized")).is_ok());
}

#[test]
fn test_expired_monthly_period_resets_regardless_of_prior_spend() {
    let (router, clock) = build(&RouterConfig {
        budget: BudgetConfig {
            daily_ceiling_usd: 100.0,
            monthly_ceiling_usd: 12.0,
            ..BudgetConfig::default()
        },
        tiers: vec![tier(TierId::Local, 4.0, 1)],
        ..RouterConfig::default()
    });
    for i in 0..3 {
        assert!(router.route(&four_dollar_request(i, "cost_optimized")).is_ok());
    }
    assert_eq!(router.ledger().remaining("default", PeriodKind::Monthly), 0);

    clock.set(
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(|| std::panic::panic_any("test: month start must exist")),
    );
    assert_eq!(
        router.ledger().remaining("default", PeriodKind::Monthly),
        12 * MICROS
    );
}

// ============================================================================
// Walk-throughs: $10/day, three $4 requests
// ============================================================================

#[test]
fn test_cost_optimized_admits_two_then_refuses_third() {
    let (router, _) = four_dollar_router();

    for i in 0..2 {
        let decision = router
            .route(&four_dollar_request(i, "cost_optimized"))
            .unwrap_or_else(|e| panic!("request {i} refused: {e}"));
        assert_eq!(decision.estimated_cost_micros, 4 * MICROS);
        assert!(!decision.over_budget);
    }

    match router.route(&four_dollar_request(2, "cost_optimized")) {
        Err(RouterError::BudgetExceeded {
            owner,
            period,
            required_usd,
            remaining_usd,
        }) => {
            assert_eq!(owner, "default");
            assert_eq!(period, PeriodKind::Daily);
            assert!((required_usd - 4.0).abs() < 1e-9);
            assert!((remaining_usd - 2.0).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }

    assert_eq!(
        router.ledger().current("default", PeriodKind::Daily).spent_micros,
        8 * MICROS
    );
    assert_eq!(router.usage().rejected_budget, 1);
}

#[test]
fn test_performance_admits_all_three_and_alerts_once_per_level() {
    let (router, _) = four_dollar_router();
    let mut events = router.ledger().subscribe();

    let first = router
        .route(&four_dollar_request(0, "performance"))
        .unwrap_or_else(|e| panic!("first refused: {e}"));
    assert!(!first.over_budget);
    assert!(alerts(&mut events).is_empty());

    let second = router
        .route(&four_dollar_request(1, "performance"))
        .unwrap_or_else(|e| panic!("second refused: {e}"));
    assert!(!second.over_budget);
    // $8 of $10 is exactly the 80% warning line.
    assert_eq!(
        alerts(&mut events),
        vec![(AlertLevel::Warning, PeriodKind::Daily)]
    );

    let third = router
        .route(&four_dollar_request(2, "performance"))
        .unwrap_or_else(|e| panic!("third refused: {e}"));
    assert!(third.over_budget);
    assert_eq!(third.reason, DecisionReason::OverBudgetOverride);
    assert_eq!(
        alerts(&mut events),
        vec![(AlertLevel::Exceeded, PeriodKind::Daily)]
    );

    let daily = router.ledger().current("default", PeriodKind::Daily);
    assert_eq!(daily.spent_micros, 12 * MICROS);
    assert!(daily.warning_sent && daily.exceeded_sent);

    // A fourth over-budget request raises nothing new.
    assert!(router.route(&four_dollar_request(3, "performance")).is_ok());
    assert!(alerts(&mut events).is_empty());
    assert_eq!(router.usage().over_budget_decisions, 2);
}

#[test]
fn test_empty_prompt_is_free_and_admitted_on_exhausted_budget() {
    let (router, _) = four_dollar_router();
    for i in 0..2 {
        assert!(router.route(&four_dollar_request(i, "performance")).is_ok());
    }
    assert!(router.route(&four_dollar_request(2, "performance")).is_ok());
    assert_eq!(router.ledger().remaining("default", PeriodKind::Daily), 0);

    for mode in EconomicMode::ALL {
        let decision = router
            .route(&RouteRequest::new("").mode(mode.as_str()))
            .unwrap_or_else(|e| panic!("empty prompt refused in {mode}: {e}"));
        assert_eq!(decision.input_tokens, 0);
        assert_eq!(decision.output_tokens, 0);
        assert_eq!(decision.estimated_cost_micros, 0);
        assert!(!decision.over_budget, "{mode}");
    }
}

#[test]
fn test_failed_tier_is_skipped_until_it_recovers() {
    // elastic is the cheapest, premium the best.
    let tiers = vec![
        tier(TierId::Local, 1.0, 1),
        tier(TierId::Elastic, 0.1, 2),
        tier(TierId::Premium, 5.0, 3),
    ];
    let (router, _) = build(&config(tiers, 1_000.0));
    let req = |i: usize, mode: &str| RouteRequest {
        output_tokens: Some(1000),
        ..RouteRequest::new(format!("prompt {i}")).mode(mode)
    };

    assert_eq!(
        router.route(&req(0, "cost_optimized")).map(|d| d.tier).ok(),
        Some(TierId::Elastic)
    );

    assert!(router.report_tier_failure(TierId::Elastic));
    for i in 1..5 {
        let cheap = router
            .route(&req(i, "cost_optimized"))
            .unwrap_or_else(|e| panic!("cost_optimized failed: {e}"));
        assert_eq!(cheap.tier, TierId::Local);
        let best = router
            .route(&req(i + 100, "performance"))
            .unwrap_or_else(|e| panic!("performance failed: {e}"));
        assert_eq!(best.tier, TierId::Premium);
        let mid = router
            .route(&req(i + 200, "balanced"))
            .unwrap_or_else(|e| panic!("balanced failed: {e}"));
        assert_ne!(mid.tier, TierId::Elastic);
    }

    router.registry().set_available(TierId::Elastic, true);
    assert_eq!(
        router.route(&req(9, "cost_optimized")).map(|d| d.tier).ok(),
        Some(TierId::Elastic)
    );
}

#[test]
fn test_owners_have_independent_budgets() {
    let (router, _) = four_dollar_router();
    for i in 0..2 {
        assert!(router
            .route(&four_dollar_request(i, "cost_optimized").owner("team-a"))
            .is_ok());
    }
    assert!(router
        .route(&four_dollar_request(2, "cost_optimized").owner("team-a"))
        .is_err());
    assert!(router
        .route(&four_dollar_request(3, "cost_optimized").owner("team-b"))
        .is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_never_overspends() {
    let (router, _) = four_dollar_router();
    let router = Arc::new(router);

    let mut handles = Vec::new();
    for i in 0..32 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router.route(&four_dollar_request(i, "cost_optimized")).is_ok()
        }));
    }
    let mut admitted = 0;
    for h in handles {
        if h.await.unwrap_or(false) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(
        router.ledger().current("default", PeriodKind::Daily).spent_micros,
        8 * MICROS
    );
}

// ============================================================================
// Decision cache: replays follow mode, budget and availability
// ============================================================================

fn cached_router(tiers: Vec<Tier>, daily_ceiling_usd: f64) -> (EconomicRouter, ManualClock) {
    let mut config = config(tiers, daily_ceiling_usd);
    config.tunables.caching_enabled = true;
    build(&config)
}

fn three_tiers() -> Vec<Tier> {
    vec![
        tier(TierId::Local, 1.0, 1),
        tier(TierId::Elastic, 2.0, 2),
        tier(TierId::Premium, 4.0, 3),
    ]
}

fn same_prompt(mode: &str) -> RouteRequest {
    RouteRequest {
        output_tokens: Some(1000),
        ..RouteRequest::new("summarise the incident report").mode(mode)
    }
}

#[test]
fn test_cached_prompt_keeps_each_mode_ordering() {
    let (router, _) = cached_router(three_tiers(), 10.0);

    let premium = router
        .route(&same_prompt("performance"))
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: route failed: {e}")));
    assert_eq!(premium.tier, TierId::Premium);
    assert_eq!(premium.estimated_cost_micros, 4 * MICROS);

    let decisions: Vec<_> = (0..10)
        .map(|_| {
            router
                .route(&same_prompt("cost_optimized"))
                .unwrap_or_else(|e| std::panic::panic_any(format!("test: route failed: {e}")))
        })
        .collect();
    assert!(decisions.iter().all(|d| d.tier == TierId::Local));
    assert_eq!(decisions[0].reason, DecisionReason::CheapestAvailable);
    assert_eq!(decisions[0].estimated_cost_micros, MICROS);
    assert!(decisions[1..]
        .iter()
        .all(|d| d.reason == DecisionReason::CacheHit && d.estimated_cost_micros == 0));

    assert_eq!(
        router.ledger().current("default", PeriodKind::Daily).spent_micros,
        5 * MICROS
    );
    assert_eq!(router.stats().cache.hits, 9);
}

#[test]
fn test_cached_prompt_still_needs_budget_for_its_tier() {
    let (router, _) = cached_router(vec![tier(TierId::Local, 4.0, 1)], 10.0);
    let repeat = same_prompt("cost_optimized");

    assert!(router.route(&repeat).is_ok());
    let hit = router
        .route(&repeat)
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: route failed: {e}")));
    assert_eq!(hit.reason, DecisionReason::CacheHit);

    assert!(router.route(&four_dollar_request(1, "cost_optimized")).is_ok());
    let refused = router.route(&repeat);
    assert!(matches!(refused, Err(RouterError::BudgetExceeded { .. })));
    assert_eq!(
        router.ledger().current("default", PeriodKind::Daily).spent_micros,
        8 * MICROS
    );
}

#[test]
fn test_cached_tier_marked_down_is_not_replayed() {
    let (router, _) = cached_router(three_tiers(), 100.0);
    let repeat = same_prompt("performance");

    let first = router
        .route(&repeat)
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: route failed: {e}")));
    assert_eq!(first.tier, TierId::Premium);

    assert!(router.report_tier_failure(TierId::Premium));
    let fallback = router
        .route(&repeat)
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: route failed: {e}")));
    assert_eq!(fallback.tier, TierId::Elastic);
    assert_ne!(fallback.reason, DecisionReason::CacheHit);
    assert_eq!(fallback.estimated_cost_micros, 2 * MICROS);
    assert_eq!(router.stats().cache.hits, 0);
}
