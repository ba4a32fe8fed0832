use crate::config::ProtectionConfig;
use crate::errors::{AppError, HandlerFailure};
use crate::observability::MetricsRecorder;
use crate::rate_limit::dedup::RequestParams;
use crate::rate_limit::limiter::{RateLimitStats, RequestGuard};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;

/// Identifier shared by every caller whose origin cannot be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Shared handle used to put routes behind the request guard.
#[derive(Clone)]
pub struct Protection {
    guard: Arc<RequestGuard>,
    trust_forwarded_headers: bool,
    max_body_bytes: usize,
}

/// Which request parameters take part in duplicate detection.
#[derive(Debug, Clone, Default)]
pub struct DedupPolicy {
    params: Option<BTreeSet<String>>,
}

impl DedupPolicy {
    /// Fingerprint every parameter of the request
    pub fn all() -> Self {
        Self { params: None }
    }

    /// Fingerprint only the listed parameters; the rest are ignored.
    pub fn with_params<I, T>(params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            params: Some(params.into_iter().map(Into::into).collect()),
        }
    }

    fn select(&self, params: RequestParams) -> RequestParams {
        match &self.params {
            Some(allowed) => params
                .into_iter()
                .filter(|(key, _)| allowed.contains(key))
                .collect(),
            None => params,
        }
    }
}

#[derive(Clone)]
struct ProtectedRoute {
    protection: Protection,
    policy: Arc<DedupPolicy>,
}

impl Protection {
    pub fn new(guard: Arc<RequestGuard>) -> Self {
        let defaults = ProtectionConfig::default();
        Self {
            guard,
            trust_forwarded_headers: defaults.trust_forwarded_headers,
            max_body_bytes: defaults.max_body_bytes,
        }
    }

    pub fn from_config(guard: Arc<RequestGuard>, config: &ProtectionConfig) -> Self {
        Self {
            guard,
            trust_forwarded_headers: config.trust_forwarded_headers,
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn guard(&self) -> &Arc<RequestGuard> {
        &self.guard
    }

    /// Put every route in `router` behind rate limiting, deduplication and
    /// lock-retry translation, in that order from the outside in.
    pub fn protect<S>(&self, router: Router<S>, policy: DedupPolicy) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let route = ProtectedRoute {
            protection: self.clone(),
            policy: Arc::new(policy),
        };

        router.route_layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    route.clone(),
                    rate_limit_middleware,
                ))
                .layer(middleware::from_fn_with_state(route, dedup_middleware))
                .layer(middleware::from_fn(lock_retry_middleware)),
        )
    }

    /// Network origin of the caller, or [`UNKNOWN_CLIENT`].
    fn client_identifier(&self, request: &Request) -> String {
        if self.trust_forwarded_headers {
            if let Some(ip) = forwarded_ip(request.headers()) {
                return ip;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Client IP as reported by a reverse proxy
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

async fn rate_limit_middleware(
    State(route): State<ProtectedRoute>,
    request: Request,
    next: Next,
) -> Response {
    let guard = &route.protection.guard;
    let client_id = route.protection.client_identifier(&request);

    let result = guard.is_allowed(&client_id);
    if !result.allowed {
        tracing::warn!(
            client_id = %client_id,
            path = %request.uri().path(),
            limit = result.limit,
            current = result.current,
            "Rate limit exceeded"
        );
        MetricsRecorder::record_rejection("rate_limit");

        return AppError::RateLimitExceeded {
            limit: result.limit,
            retry_after: guard.config().window,
        }
        .into_response();
    }

    MetricsRecorder::record_admission();
    let mut response = next.run(request).await;

    let stats = guard.get_stats(&client_id);
    add_rate_limit_headers(response.headers_mut(), &stats);

    response
}

async fn dedup_middleware(
    State(route): State<ProtectedRoute>,
    request: Request,
    next: Next,
) -> Response {
    let (request, params) = match extract_params(request, route.protection.max_body_bytes).await {
        Ok(extracted) => extracted,
        Err(err) => return err.into_response(),
    };
    let Some(params) = params else {
        // Unreadable input would all share one fingerprint; let the handler reject it
        tracing::debug!(
            path = %request.uri().path(),
            "Request parameters unreadable, skipping duplicate check"
        );
        return next.run(request).await;
    };
    let params = route.policy.select(params);

    let check = route.protection.guard.is_duplicate(&params);
    if check.is_duplicate {
        tracing::info!(
            path = %request.uri().path(),
            params = ?params,
            fingerprint = %&check.fingerprint[..8],
            "Duplicate request detected"
        );
        MetricsRecorder::record_rejection("duplicate");

        return AppError::DuplicateRequest {
            window: route.protection.guard.config().dedup_window,
        }
        .into_response();
    }

    next.run(request).await
}

async fn lock_retry_middleware(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    let contention = response
        .extensions()
        .get::<HandlerFailure>()
        .filter(|failure| failure.store_contention)
        .map(|failure| failure.description.clone());

    let Some(description) = contention else {
        return response;
    };

    tracing::error!(
        path = %path,
        error = %description,
        "Database still locked after the store's own retries"
    );
    MetricsRecorder::record_rejection("database_busy");
    AppError::DatabaseBusy.into_response()
}

/// Pull the dedup-relevant parameters out of a request.
///
/// Query parameters for reads, the JSON object body for writes. The body is
/// buffered and put back so the handler can still extract it. `None` means
/// the parameters could not be read.
async fn extract_params(
    request: Request,
    max_body_bytes: usize,
) -> Result<(Request, Option<RequestParams>), AppError> {
    match *request.method() {
        Method::GET | Method::HEAD => {
            let params = Query::<BTreeMap<String, String>>::try_from_uri(request.uri())
                .ok()
                .map(|Query(query)| {
                    query
                        .into_iter()
                        .map(|(key, value)| (key, Value::String(value)))
                        .collect()
                });
            Ok((request, params))
        }
        Method::POST | Method::PUT | Method::PATCH => {
            let (parts, body) = request.into_parts();
            let bytes = axum::body::to_bytes(body, max_body_bytes)
                .await
                .map_err(|e| AppError::ValidationError(format!("Invalid request body: {}", e)))?;

            let params = match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => Some(map.into_iter().collect()),
                _ => None,
            };

            Ok((Request::from_parts(parts, Body::from(bytes)), params))
        }
        _ => Ok((request, Some(RequestParams::new()))),
    }
}

/// Add rate limit headers to response
fn add_rate_limit_headers(headers: &mut HeaderMap, stats: &RateLimitStats) {
    // X-RateLimit-Limit: Maximum number of requests allowed in the window
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(stats.max_requests),
    );

    // X-RateLimit-Remaining: Number of requests remaining
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(stats.remaining),
    );

    // X-RateLimit-Reset: Unix timestamp when the oldest request leaves the window
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(stats.reset_at),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::rate_limit::limiter::LimiterConfig;
    use axum::{
        body::to_bytes,
        http::StatusCode,
        routing::{get, post},
        Json,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn protection(max_requests: u32) -> Protection {
        let config = LimiterConfig::new(
            max_requests,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .unwrap();
        Protection::new(Arc::new(RequestGuard::new(config)))
    }

    /// Router whose handler counts its invocations and echoes the body
    fn counting_app(protection: &Protection, policy: DedupPolicy) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let read_counter = calls.clone();

        let router = Router::new()
            .route(
                "/leads",
                post(move |Json(body): Json<Value>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"success": true, "echo": body}))
                    }
                }),
            )
            .route(
                "/score",
                get(move || {
                    let counter = read_counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"success": true}))
                    }
                }),
            );

        (protection.protect(router, policy), calls)
    }

    fn post_json(uri: &str, body: Value) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn read(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unreadable_bodies_skip_duplicate_check() {
        let protection = protection(10);
        let (app, calls) = counting_app(&protection, DedupPolicy::all());

        // Non-object JSON reaches the handler every time
        for body in [json!([1, 2]), json!(["other"])] {
            let response = app.clone().oneshot(post_json("/leads", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Broken JSON is left to the handler's own extractor
        for _ in 0..2 {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/leads")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        assert_eq!(protection.guard().tracked_fingerprints(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_without_calling_handler() {
        let protection = protection(2);
        let (app, calls) = counting_app(&protection, DedupPolicy::all());

        for i in 0..2 {
            let response = app.clone().oneshot(read(&format!("/score?n={}", i))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(read("/score?n=99")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["reason"], "rate_limit");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["retry_after"], 1.0);
    }

    #[tokio::test]
    async fn test_success_carries_rate_limit_headers() {
        let protection = protection(5);
        let (app, _) = counting_app(&protection, DedupPolicy::all());

        let response = app.oneshot(read("/score?whatsapp=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "4");
        assert!(headers.get("x-ratelimit-reset").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_body_is_rejected_with_conflict() {
        let protection = protection(10);
        let (app, calls) = counting_app(&protection, DedupPolicy::all());
        let lead = json!({"whatsapp": "5531999887766", "score": 45});

        let response = app.clone().oneshot(post_json("/leads", lead.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Handler still sees the buffered body
        let body = body_json(response).await;
        assert_eq!(body["echo"]["whatsapp"], "5531999887766");

        let response = app.clone().oneshot(post_json("/leads", lead)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let body = body_json(response).await;
        assert_eq!(body["reason"], "duplicate");
        assert_eq!(body["window_seconds"], 5.0);
    }

    #[tokio::test]
    async fn test_dedup_allow_list_ignores_incidental_fields() {
        let protection = protection(10);
        let (app, calls) =
            counting_app(&protection, DedupPolicy::with_params(["whatsapp", "score"]));

        let first = json!({"whatsapp": "123", "score": 45, "notes": "called twice"});
        let second = json!({"whatsapp": "123", "score": 45, "notes": "different text"});
        let third = json!({"whatsapp": "123", "score": 50, "notes": "different text"});

        let response = app.clone().oneshot(post_json("/leads", first)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(post_json("/leads", second)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(post_json("/leads", third)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_params_are_fingerprinted_for_reads() {
        let protection = protection(10);
        let (app, _) = counting_app(&protection, DedupPolicy::all());

        let response = app.clone().oneshot(read("/score?whatsapp=1&score=45")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(read("/score?score=45&whatsapp=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_rate_limit_is_checked_before_dedup() {
        let protection = protection(1);
        let (app, _) = counting_app(&protection, DedupPolicy::all());
        let lead = json!({"whatsapp": "123", "score": 45});

        let response = app.clone().oneshot(post_json("/leads", lead.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same payload again: over quota wins over duplicate
        let response = app.clone().oneshot(post_json("/leads", lead)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(protection.guard().tracked_fingerprints(), 1);
    }

    #[tokio::test]
    async fn test_clients_are_identified_by_peer_address() {
        let protection = protection(1);
        let (app, _) = counting_app(&protection, DedupPolicy::all());

        let from = |ip: [u8; 4], uri: &str| {
            let mut request = read(uri);
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
            request
        };

        let response = app.clone().oneshot(from([10, 0, 0, 1], "/score?n=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(from([10, 0, 0, 1], "/score?n=2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let response = app.clone().oneshot(from([10, 0, 0, 2], "/score?n=3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(protection.guard().get_stats("10.0.0.1").requests_in_window, 1);
    }

    #[tokio::test]
    async fn test_missing_origin_shares_unknown_identifier() {
        let protection = protection(5);
        let (app, _) = counting_app(&protection, DedupPolicy::all());

        app.oneshot(read("/score?n=1")).await.unwrap();
        assert_eq!(protection.guard().get_stats(UNKNOWN_CLIENT).requests_in_window, 1);
    }

    #[test]
    fn test_forwarded_ip_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(forwarded_ip(&headers).as_deref(), Some("192.168.1.1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.42"));
        assert_eq!(forwarded_ip(&headers).as_deref(), Some("203.0.113.42"));

        assert_eq!(forwarded_ip(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_forwarded_headers_only_used_when_trusted() {
        let untrusted = protection(5);
        let trusted = protection(5).trust_forwarded_headers(true);

        let request = || {
            Request::builder()
                .uri("/score")
                .header("x-forwarded-for", "198.51.100.7")
                .body(Body::empty())
                .unwrap()
        };

        let (app, _) = counting_app(&untrusted, DedupPolicy::all());
        app.oneshot(request()).await.unwrap();
        assert_eq!(untrusted.guard().get_stats(UNKNOWN_CLIENT).requests_in_window, 1);

        let (app, _) = counting_app(&trusted, DedupPolicy::all());
        app.oneshot(request()).await.unwrap();
        assert_eq!(trusted.guard().get_stats("198.51.100.7").requests_in_window, 1);
    }

    async fn locked_handler() -> Result<Json<Value>> {
        Err(AppError::Internal("database is locked".to_string()))
    }

    async fn invalid_handler() -> Result<Json<Value>> {
        Err(AppError::ValidationError("score must be between 0 and 100".to_string()))
    }

    #[tokio::test]
    async fn test_store_contention_becomes_service_busy() {
        let protection = protection(10);
        let app = protection.protect(
            Router::new().route("/locked", get(locked_handler)),
            DedupPolicy::all(),
        );

        let response = app.oneshot(read("/locked")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("x-ratelimit-limit").is_some());

        let body = body_json(response).await;
        assert_eq!(body["reason"], "database_busy");
        assert_eq!(body["retry_after"], 2);
    }

    #[tokio::test]
    async fn test_other_failures_propagate_unchanged() {
        let protection = protection(10);
        let app = protection.protect(
            Router::new().route("/invalid", get(invalid_handler)),
            DedupPolicy::all(),
        );

        let response = app.oneshot(read("/invalid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"], "score must be between 0 and 100");
    }

    #[tokio::test]
    async fn test_unprotected_routes_are_untouched() {
        let protection = protection(1);
        let protected = protection.protect(
            Router::new().route("/protected", get(|| async { "ok" })),
            DedupPolicy::all(),
        );
        let app = Router::new()
            .route("/open", get(|| async { "ok" }))
            .merge(protected);

        for _ in 0..3 {
            let response = app.clone().oneshot(read("/open")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
        assert_eq!(protection.guard().tracked_clients(), 0);
    }

    #[tokio::test]
    async fn test_burst_from_automation_client() {
        let config =
            LimiterConfig::new(10, Duration::from_secs(1), Duration::from_secs(5)).unwrap();
        let protection = Protection::new(Arc::new(RequestGuard::new(config)));
        let (app, calls) =
            counting_app(&protection, DedupPolicy::with_params(["whatsapp", "score"]));

        let mut statuses = BTreeMap::new();
        for i in 0..50 {
            let lead = json!({"whatsapp": format!("5531999{:06}", i), "score": 45 + (i % 50)});
            let response = app.clone().oneshot(post_json("/leads", lead)).await.unwrap();
            *statuses.entry(response.status().as_u16()).or_insert(0) += 1;
        }

        assert_eq!(statuses.get(&200), Some(&10));
        assert_eq!(statuses.get(&429), Some(&40));
        assert_eq!(statuses.get(&409), None);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
