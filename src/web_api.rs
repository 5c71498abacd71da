//! Web API Server
//!
//! HTTP front end for an [`EconomicRouter`].
//!
//! ## Endpoints
//!
//! - `POST /api/v1/route`: Route one prompt, debit its estimate
//! - `GET  /api/v1/stats`: Usage, cache-hit rate, budgets, optimizer counters
//! - `GET  /api/v1/mode`: Current default economic mode
//! - `PUT  /api/v1/mode`: Change the default economic mode
//! - `GET  /api/v1/recommendations`: Recent optimizer recommendations
//! - `GET  /health`: Per-tier availability
//! - `GET  /metrics`: Prometheus metrics
//!
//! Every response carries `x-request-id`, echoed from the request or freshly
//! generated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::optimizer::{MonitorStats, OptimizationMonitor, Recommendation};
use crate::orchestrator::{EconomicRouter, HealthReport, RouteRequest, RouterStats};
use crate::routing::{DecisionReason, EconomicMode, PeriodKind, RoutingDecision, TierId};
use crate::RouterError;

/// Default page size for `/api/v1/recommendations`.
const DEFAULT_RECOMMENDATION_LIMIT: usize = 20;

// ============================================================================
// Types
// ============================================================================

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The router being served.
    pub router: Arc<EconomicRouter>,
    /// Optimization monitor, when one is running.
    pub monitor: Option<Arc<OptimizationMonitor>>,
}

impl AppState {
    /// State without a monitor.
    pub fn new(router: Arc<EconomicRouter>) -> Self {
        Self {
            router,
            monitor: None,
        }
    }

    /// Attach a monitor.
    pub fn with_monitor(mut self, monitor: Arc<OptimizationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

/// JSON response for `POST /api/v1/route`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    /// Decision id.
    pub decision_id: Uuid,
    /// Chosen tier.
    pub tier: TierId,
    /// Time spent deciding, in milliseconds.
    pub latency_ms: f64,
    /// Estimated cost in USD.
    pub cost_estimate: f64,
    /// Admitted over budget (performance mode only).
    pub over_budget: bool,
    /// Why this tier.
    pub reason: DecisionReason,
    /// Mode applied.
    pub mode: EconomicMode,
    /// Period that governed the decision.
    pub binding_period: PeriodKind,
    /// Estimated input tokens.
    pub input_tokens: u64,
    /// Estimated output tokens.
    pub output_tokens: u64,
}

impl From<&RoutingDecision> for RouteResponse {
    fn from(d: &RoutingDecision) -> Self {
        Self {
            decision_id: d.id,
            tier: d.tier,
            latency_ms: d.latency_ms(),
            cost_estimate: d.cost_usd(),
            over_budget: d.over_budget,
            reason: d.reason,
            mode: d.mode,
            binding_period: d.binding_period,
            input_tokens: d.input_tokens,
            output_tokens: d.output_tokens,
        }
    }
}

/// Body of `PUT /api/v1/mode` and response of both mode endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeBody {
    /// Wire name of the mode.
    pub mode: String,
}

/// `GET /api/v1/stats` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Router statistics.
    #[serde(flatten)]
    pub router: RouterStats,
    /// Optimizer counters, when a monitor is running.
    pub optimizer: Option<MonitorStats>,
}

#[derive(Debug, Deserialize)]
struct RecommendationQuery {
    limit: Option<usize>,
}

// ============================================================================
// Server
// ============================================================================

/// Build the application router.
pub fn app(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/api/v1/route", post(route_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/mode", get(get_mode_handler).put(put_mode_handler))
        .route("/api/v1/recommendations", get(recommendations_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(
            Duration::from_secs(config.timeout_seconds),
            timeout_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(DefaultBodyLimit::max(config.max_request_size))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` flips to `true`.
///
/// # Errors
///
/// [`RouterError::Other`] if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RouterError> {
    let addr = listener
        .local_addr()
        .map_err(|e| RouterError::Other(format!("listener address unavailable: {e}")))?;
    info!(%addr, "web API ready");

    axum::serve(listener, app(state, config))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| RouterError::Other(format!("web API failed: {e}")))?;
    info!("web API stopped");
    Ok(())
}

/// Bind `config.host:config.port` and serve.
///
/// # Errors
///
/// [`RouterError::Other`] if the address cannot be bound or the server fails.
pub async fn start_server(
    config: ServerConfig,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RouterError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RouterError::Other(format!("cannot bind {addr}: {e}")))?;
    serve(listener, state, &config, shutdown).await
}

// ============================================================================
// Middleware
// ============================================================================

/// Echo or assign `x-request-id`.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Answer 408 when a handler runs past `limit`.
async fn timeout_middleware(State(limit): State<Duration>, req: Request<Body>, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(timeout_secs = limit.as_secs(), "request timed out");
            (
                StatusCode::REQUEST_TIMEOUT,
                Json(serde_json::json!({"error": "timeout", "message": "request timed out"})),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /api/v1/route`
async fn route_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RouteRequest>,
) -> Result<Json<RouteResponse>, AppError> {
    let decision = state.router.route(&req)?;
    Ok(Json(RouteResponse::from(&decision)))
}

/// `GET /api/v1/stats`
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        router: state.router.stats(),
        optimizer: state.monitor.as_ref().map(|m| m.stats()),
    })
}

/// `GET /api/v1/mode`
async fn get_mode_handler(State(state): State<AppState>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: state.router.mode().as_str().to_string(),
    })
}

/// `PUT /api/v1/mode`
async fn put_mode_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ModeBody>,
) -> Result<Json<ModeBody>, AppError> {
    let mode = state.router.set_mode(&body.mode)?;
    Ok(Json(ModeBody {
        mode: mode.as_str().to_string(),
    }))
}

/// `GET /api/v1/recommendations?limit=N`
async fn recommendations_handler(
    State(state): State<AppState>,
    Query(query): Query<RecommendationQuery>,
) -> Json<Vec<Recommendation>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECOMMENDATION_LIMIT);
    Json(
        state
            .monitor
            .as_ref()
            .map(|m| m.recommendations(limit))
            .unwrap_or_default(),
    )
}

/// `GET /health`
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.router.health())
}

/// `GET /metrics`
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Body Extraction
// ============================================================================

/// JSON body extractor whose rejections carry the same typed body as
/// [`AppError`].
///
/// Undecodable bodies become [`RouterError::Estimation`] (400). Bodies over
/// the size limit keep their 413 status.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(body_rejection(rejection)),
        }
    }
}

fn body_rejection(rejection: JsonRejection) -> Response {
    let status = rejection.status();
    let detail = rejection.body_text();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %detail, "request body too large");
        let body = serde_json::json!({
            "error": "payload_too_large",
            "message": detail,
            "retryable": false,
        });
        return (status, Json(body)).into_response();
    }
    AppError(RouterError::Estimation(format!("invalid request body: {detail}"))).into_response()
}

// ============================================================================
// Error Type
// ============================================================================

/// Maps a [`RouterError`] to an HTTP status and a JSON body
/// `{"error": code, "message": text, "retryable": bool}`.
#[derive(Debug)]
pub struct AppError(pub RouterError);

impl From<RouterError> for AppError {
    fn from(e: RouterError) -> Self {
        Self(e)
    }
}

impl AppError {
    /// HTTP status for the wrapped error.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RouterError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            RouterError::InvalidMode(_) | RouterError::Estimation(_) => StatusCode::BAD_REQUEST,
            RouterError::TierUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Configuration(_)
            | RouterError::OptimizationCycle(_)
            | RouterError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_minimal_deserializes() {
        let req: RouteRequest = serde_json::from_str(r#"{"prompt": "hello"}"#).expect("deser");
        assert_eq!(req.prompt, "hello");
        assert!(req.economic_mode.is_none());
        assert!(req.task_type.is_none());
        assert!(req.owner.is_none());
        assert!(req.output_tokens.is_none());
    }

    #[test]
    fn test_route_request_full_deserializes() {
        let json = r#"{
            "prompt": "test",
            "task_type": "complex",
            "economic_mode": "performance",
            "owner": "team-a",
            "output_tokens": 256
        }"#;
        let req: RouteRequest = serde_json::from_str(json).expect("deser");
        assert_eq!(req.economic_mode.as_deref(), Some("performance"));
        assert_eq!(req.owner.as_deref(), Some("team-a"));
        assert_eq!(req.output_tokens, Some(256));
    }

    #[test]
    fn test_app_error_budget_exceeded_returns_402() {
        let err = AppError(RouterError::BudgetExceeded {
            owner: "a".into(),
            period: PeriodKind::Daily,
            required_usd: 4.0,
            remaining_usd: 2.0,
        });
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_app_error_invalid_mode_returns_400() {
        let resp = AppError(RouterError::InvalidMode("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_app_error_estimation_returns_400() {
        let resp = AppError(RouterError::Estimation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_app_error_tier_unavailable_returns_503() {
        let resp = AppError(RouterError::TierUnavailable("premium".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_mode_body_round_trips() {
        let body = ModeBody {
            mode: "balanced".into(),
        };
        let json = serde_json::to_string(&body).expect("ser");
        assert_eq!(json, r#"{"mode":"balanced"}"#);
    }
}
