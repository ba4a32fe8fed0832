use crate::{
    api::{health, leads},
    observability::{HealthChecker, MetricsRecorder},
    rate_limit::{DedupPolicy, Protection},
};
use axum::{
    extract::{FromRef, MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Fields that identify a repeated lead write from the automation workflow
const LEAD_DEDUP_PARAMS: [&str; 2] = ["whatsapp", "score"];

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub health_checker: Arc<HealthChecker>,
}

pub fn create_router(db_pool: SqlitePool, protection: Protection) -> Router {
    let state = AppState {
        health_checker: Arc::new(HealthChecker::new(db_pool.clone())),
        db_pool,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
        .route("/api/leads/:whatsapp", get(leads::get_lead))
        .merge(protected_routes(&protection))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Write endpoints the automation workflow hits in bursts
fn protected_routes(protection: &Protection) -> Router<AppState> {
    let register = protection.protect(
        Router::new().route("/api/leads/registrar", post(leads::register)),
        DedupPolicy::with_params(LEAD_DEDUP_PARAMS),
    );

    let score = protection.protect(
        Router::new().route("/api/leads/score", get(leads::update_score)),
        DedupPolicy::with_params(LEAD_DEDUP_PARAMS),
    );

    register.merge(score)
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    MetricsRecorder::record_http_request(&method, &path, response.status().as_u16());
    MetricsRecorder::record_http_duration(&method, &path, started.elapsed().as_secs_f64());

    response
}
