//! Per-request orchestration.
//!
//! `GatewayService` runs each inbound request through a fixed pipeline:
//! context → request log → rate limit → circuit preflight → authentication →
//! cache lookup → forward with retry → cache store → metrics → respond.
//! Every dependency is injected at construction; there is no ambient state.
//! Anything unexpected is converted at the boundary into a 500 carrying the
//! generated request id and never propagates further.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::JoinSet;
use tower::Service;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::access_log::{self, AccessRecord};
use crate::auth::Authenticator;
use crate::cache::{self, CacheHit, CachePolicy, CacheStrategy, ResponseCache};
use crate::circuit::CircuitRegistry;
use crate::config::{GatewayConfig, RouteConfig};
use crate::error::{GatewayError, Result};
use crate::metrics::{MetricSample, MetricsAggregator};
use crate::ratelimit::{bearer_token, KeyExtractor, RateLimitDecision, RateLimiter};
use crate::router::{GatewayResponse, ServiceRouter};
use crate::store::{now_millis, CounterStore};

/// Buffered response body type used throughout the gateway.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Peer address of the accepted connection, injected by the listener as a
/// request extension.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub IpAddr);

/// Per-request state, created at arrival and dropped at response time.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub route: String,
    pub method: Method,
    pub client_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub start: Instant,
    /// Admission decision, once the request has passed the gate.
    pub rate_decision: Option<RateLimitDecision>,
}

struct Inner {
    config: GatewayConfig,
    limiter: RateLimiter,
    keys: KeyExtractor,
    circuits: Arc<CircuitRegistry>,
    cache: Arc<ResponseCache>,
    router: Arc<ServiceRouter>,
    metrics: Arc<MetricsAggregator>,
    auth: Arc<dyn Authenticator>,
    /// Detached stale-while-revalidate refreshes, drained at shutdown.
    refresh_tasks: tokio::sync::Mutex<JoinSet<()>>,
}

/// The gateway request pipeline as a `tower::Service`.
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<Inner>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn CounterStore>,
        cache: Arc<ResponseCache>,
        circuits: Arc<CircuitRegistry>,
        router: Arc<ServiceRouter>,
        metrics: Arc<MetricsAggregator>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let keys = KeyExtractor::new(config.trust_forwarded_for);
        Self {
            inner: Arc::new(Inner {
                config,
                limiter: RateLimiter::new(store),
                keys,
                circuits,
                cache,
                router,
                metrics,
                auth,
                refresh_tasks: tokio::sync::Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Awaits all in-flight background refreshes; called during shutdown.
    pub async fn drain_background(&self) {
        let mut tasks = self.inner.refresh_tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    async fn handle(inner: Arc<Inner>, req: Request<Incoming>) -> Response<ResponseBody> {
        let mut ctx = RequestContext {
            request_id: Uuid::new_v4().to_string(),
            route: String::new(),
            method: req.method().clone(),
            client_ip: req.extensions().get::<ClientAddr>().map(|a| a.0),
            user_id: None,
            start: Instant::now(),
            rate_decision: None,
        };
        let path = req.uri().path().to_string();

        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %path,
            "request received"
        );

        let mut response = match Self::process(&inner, req, &mut ctx).await {
            Ok(response) => response,
            Err(e) => Self::error_response(&e, &ctx),
        };

        if let Some(decision) = &ctx.rate_decision {
            apply_rate_headers(response.headers_mut(), decision);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        let latency_ms = ctx.start.elapsed().as_secs_f64() * 1_000.0;
        let status = response.status().as_u16();
        inner.metrics.record(
            MetricSample {
                timestamp: now_millis(),
                method: ctx.method.to_string(),
                path: path.clone(),
                status,
                latency_ms,
            },
            if ctx.route.is_empty() {
                "unmatched"
            } else {
                ctx.route.as_str()
            },
        );

        access_log::emit(&AccessRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: ctx.request_id.clone(),
            route: ctx.route.clone(),
            client_ip: ctx
                .client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            method: ctx.method.to_string(),
            path,
            status,
            latency_ms,
            backend: None,
        });

        response
    }

    async fn process(
        inner: &Arc<Inner>,
        req: Request<Incoming>,
        ctx: &mut RequestContext,
    ) -> Result<Response<ResponseBody>> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        let route = inner
            .config
            .resolve_route(&path)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound { path: path.clone() })?;
        ctx.route = route.name.clone();

        // Admission control.
        let key = inner.keys.admission_key(
            route.limit.key_strategy,
            req.headers(),
            ctx.client_ip,
            &path,
        );
        let decision = inner.limiter.should_limit(&key, &route.limit).await;
        if decision.limited {
            warn!(request_id = %ctx.request_id, key = %key, "request rate limited");
            return Ok(rate_limited_response(&decision));
        }
        ctx.rate_decision = Some(decision);

        // Circuit preflight for the resolved backend.
        let replicas = inner.router.replica_names(&route.backend);
        if !replicas.is_empty() && !inner.circuits.any_available(&replicas) {
            return Err(GatewayError::CircuitOpen {
                backend: route.backend.clone(),
            });
        }

        // External authentication, when the route requires it.
        if route.requires_auth {
            let token = bearer_token(req.headers()).unwrap_or("");
            let outcome = inner.auth.verify(token).await;
            if !outcome.authenticated {
                return Err(GatewayError::Unauthorized);
            }
            ctx.user_id = outcome.user_id;
        }

        let is_get = ctx.method == Method::GET;
        let policy = route.cache_policy();
        let principal = ctx.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
        let cache_key = cache::cache_key(ctx.method.as_str(), &path, &query, &principal);
        let path_and_query = if query.is_empty() {
            path.clone()
        } else {
            format!("{}?{}", path, query)
        };

        // Cache lookup (network-first routes consult the cache only as a
        // fallback after the network path fails).
        if is_get {
            if let Some(policy) = policy
                .as_ref()
                .filter(|p| p.strategy != CacheStrategy::NetworkFirst)
            {
                if let Some(hit) = inner.cache.lookup(&cache_key) {
                    if hit.needs_refresh {
                        Self::spawn_refresh(
                            inner,
                            route.clone(),
                            path_and_query.clone(),
                            cache_key.clone(),
                            policy.clone(),
                        )
                        .await;
                    }
                    debug!(request_id = %ctx.request_id, "cache hit");
                    return Ok(cache_hit_response(&hit));
                }
            }
        }

        // Forward with retry; attempt outcomes feed the circuit breaker
        // inside the router.
        let headers = req.headers().clone();
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(GatewayError::Http)?
            .to_bytes();

        let forwarded = inner
            .router
            .forward(
                &route.backend,
                ctx.method.clone(),
                &path_and_query,
                &headers,
                body,
                route.base_timeout(),
            )
            .await;

        let upstream = match forwarded {
            Ok(upstream) if !upstream.status.is_server_error() => upstream,
            degraded => {
                // Network-first routes fall back to a cached copy before
                // surfacing the failure.
                if is_get {
                    if policy
                        .as_ref()
                        .is_some_and(|p| p.strategy == CacheStrategy::NetworkFirst)
                    {
                        if let Some(hit) = inner.cache.lookup(&cache_key) {
                            debug!(
                                request_id = %ctx.request_id,
                                "serving cached response after upstream failure"
                            );
                            return Ok(cache_hit_response(&hit));
                        }
                    }
                }
                match degraded {
                    Ok(upstream) => upstream,
                    Err(e) => return Err(e),
                }
            }
        };

        // Cache store on cacheable success.
        if is_get {
            if let Some(policy) = &policy {
                inner.cache.store(
                    cache_key,
                    upstream.status.as_u16(),
                    cacheable_headers(&upstream.headers),
                    &upstream.body,
                    policy,
                    vec![route.name.clone()],
                );
            }
        }

        Ok(upstream_response(upstream))
    }

    /// Spawns a detached refresh for a stale entry. Errors are logged and
    /// discarded; the triggering request is never blocked or failed.
    async fn spawn_refresh(
        inner: &Arc<Inner>,
        route: RouteConfig,
        path_and_query: String,
        cache_key: String,
        policy: CachePolicy,
    ) {
        let task_inner = Arc::clone(inner);
        let mut tasks = inner.refresh_tasks.lock().await;
        // Reap already-finished refreshes so the set stays small.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = task_inner
                .router
                .forward(
                    &route.backend,
                    Method::GET,
                    &path_and_query,
                    &http::HeaderMap::new(),
                    Bytes::new(),
                    route.base_timeout(),
                )
                .await;
            match result {
                Ok(fresh) if fresh.status.is_success() => {
                    task_inner.cache.store(
                        cache_key,
                        fresh.status.as_u16(),
                        cacheable_headers(&fresh.headers),
                        &fresh.body,
                        &policy,
                        vec![route.name.clone()],
                    );
                    debug!(route = %route.name, "background cache refresh completed");
                }
                Ok(fresh) => {
                    debug!(
                        route = %route.name,
                        status = fresh.status.as_u16(),
                        "background refresh returned non-success, keeping stale entry"
                    );
                }
                Err(e) => {
                    debug!(route = %route.name, error = %e, "background cache refresh failed");
                }
            }
        });
    }

    /// Boundary conversion of pipeline errors into responses. Nothing
    /// escapes the orchestrator.
    fn error_response(e: &GatewayError, ctx: &RequestContext) -> Response<ResponseBody> {
        match e {
            GatewayError::RouteNotFound { path } => json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({
                    "error": "NOT_FOUND",
                    "message": format!("no route for path: {}", path),
                }),
            ),
            GatewayError::CircuitOpen { .. } => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "Service temporarily unavailable",
                    "reason": "circuit open",
                }),
            ),
            GatewayError::UpstreamUnavailable { backend } => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "Service temporarily unavailable",
                    "reason": format!("no replica available for {}", backend),
                }),
            ),
            GatewayError::UpstreamTimeout { .. } => json_response(
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({
                    "error": "GATEWAY_TIMEOUT",
                    "message": e.to_string(),
                }),
            ),
            GatewayError::UpstreamError { .. } => json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "error": "BAD_GATEWAY",
                    "message": e.to_string(),
                }),
            ),
            GatewayError::Unauthorized => json_response(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({
                    "error": "UNAUTHORIZED",
                    "message": "authentication required",
                }),
            ),
            other => {
                error!(
                    request_id = %ctx.request_id,
                    error = %other,
                    "unhandled error in request pipeline"
                );
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({
                        "error": "INTERNAL_ERROR",
                        "requestId": ctx.request_id,
                    }),
                )
            }
        }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { Ok(Self::handle(inner, req).await) })
    }
}

/// Boxes a buffered body.
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Builds a JSON response with the given status.
pub fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(value.to_string())))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn apply_rate_headers(headers: &mut http::HeaderMap, decision: &RateLimitDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        (
            "x-ratelimit-reset",
            decision
                .reset_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response<ResponseBody> {
    let retry_after = decision.retry_after_secs();
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        serde_json::json!({
            "error": "RATE_LIMITED",
            "message": "too many requests, slow down",
            "retryAfter": retry_after,
        }),
    );
    apply_rate_headers(response.headers_mut(), decision);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(http::header::RETRY_AFTER, value);
    }
    response
}

fn cache_hit_response(hit: &CacheHit) -> Response<ResponseBody> {
    let mut builder = Response::builder().status(hit.status);
    for (name, value) in &hit.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder
        .header("x-cache", "HIT")
        .header("x-cache-age", hit.age.as_secs().to_string());
    builder
        .body(full_body(hit.body.clone()))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn upstream_response(upstream: GatewayResponse) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

/// Response headers worth persisting alongside a cached body.
fn cacheable_headers(headers: &http::HeaderMap) -> Vec<(String, String)> {
    const KEEP: [&str; 4] = ["content-type", "content-language", "etag", "last-modified"];
    KEEP.iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn decision() -> RateLimitDecision {
        RateLimitDecision {
            limited: false,
            remaining: 7,
            limit: 10,
            reset_at: Utc::now(),
            retry_after: Some(Duration::from_secs(30)),
        }
    }

    #[test]
    fn test_rate_limited_response_shape() {
        let mut d = decision();
        d.limited = true;
        d.remaining = 0;
        let response = rate_limited_response(&d);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    #[test]
    fn test_rate_headers_applied() {
        let mut response = json_response(StatusCode::OK, serde_json::json!({}));
        apply_rate_headers(response.headers_mut(), &decision());

        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "7");
    }

    #[test]
    fn test_cache_hit_response_headers() {
        let hit = CacheHit {
            body: Bytes::from_static(b"cached"),
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            age: Duration::from_secs(12),
            needs_refresh: false,
        };
        let response = cache_hit_response(&hit);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(response.headers().get("x-cache-age").unwrap(), "12");
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_error_response_mapping() {
        let ctx = RequestContext {
            request_id: "rid".to_string(),
            route: "r".to_string(),
            method: Method::GET,
            client_ip: None,
            user_id: None,
            start: Instant::now(),
            rate_decision: None,
        };

        let circuit = GatewayService::error_response(
            &GatewayError::CircuitOpen {
                backend: "content".to_string(),
            },
            &ctx,
        );
        assert_eq!(circuit.status(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout = GatewayService::error_response(
            &GatewayError::UpstreamTimeout {
                backend: "content".to_string(),
                duration_ms: 100,
            },
            &ctx,
        );
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let unauthorized = GatewayService::error_response(&GatewayError::Unauthorized, &ctx);
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let unexpected = GatewayService::error_response(
            &GatewayError::Config("boom".to_string()),
            &ctx,
        );
        assert_eq!(unexpected.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_cacheable_headers_filter() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("set-cookie", HeaderValue::from_static("secret=1"));

        let kept = cacheable_headers(&headers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "content-type");
    }
}
