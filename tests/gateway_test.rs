//! End-to-end tests driving the full gateway pipeline over real sockets
//! against mock upstream services.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use edgegate::auth::AllowAll;
use edgegate::cache::ResponseCache;
use edgegate::circuit::{CircuitConfig, CircuitRegistry};
use edgegate::config::{BackendConfig, GatewayConfig, RouteClass, RouteConfig, StoreBackend};
use edgegate::gateway::GatewayService;
use edgegate::listener::GatewayListener;
use edgegate::metrics::MetricsAggregator;
use edgegate::ratelimit::LimitPolicy;
use edgegate::retry::RetryConfig;
use edgegate::router::{Replica, ServiceRouter};
use edgegate::store::MemoryStore;

/// Starts a mock upstream whose responses come from `handler`.
/// Returns its base URL.
async fn start_mock_upstream<F>(handler: F) -> String
where
    F: Fn(u64) -> (StatusCode, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let hits = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let handler = Arc::clone(&handler);
            let hits = Arc::clone(&hits);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| {
                    let n = hits.fetch_add(1, Ordering::SeqCst) as u64;
                    let (status, body) = handler.as_ref()(n);
                    async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "text/plain")
                                .body(body)
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn test_config(upstream_url: &str, limit: LimitPolicy, class: RouteClass) -> GatewayConfig {
    let backends = HashMap::from([(
        "content".to_string(),
        BackendConfig {
            replicas: vec![Replica {
                name: "content-1".to_string(),
                url: upstream_url.to_string(),
                weight: 1,
            }],
            circuit: CircuitConfig {
                failure_threshold: 3,
                open_timeout_ms: 30_000,
            },
        },
    )]);

    let routes = vec![RouteConfig {
        name: "content".to_string(),
        path_prefix: "/api/content".to_string(),
        backend: "content".to_string(),
        class,
        requires_auth: false,
        limit,
        base_timeout_ms: 2_000,
        cache_ttl_ms: None,
        cache_strategy: None,
    }];

    GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        admin_addr: "127.0.0.1:0".to_string(),
        store: StoreBackend::Memory,
        auth_verify_url: None,
        trust_forwarded_for: false,
        cache_capacity: 64,
        evict_fraction: 0.25,
        sweep_interval_ms: 60_000,
        metrics_capacity: 1_024,
        backends,
        routes,
    }
}

struct RunningGateway {
    base_url: String,
    metrics: Arc<MetricsAggregator>,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_gateway(config: GatewayConfig) -> RunningGateway {
    let circuits = Arc::new(CircuitRegistry::with_defaults());
    for backend in config.backends.values() {
        for replica in &backend.replicas {
            circuits.configure(replica.name.clone(), backend.circuit.clone());
        }
    }
    let metrics = Arc::new(MetricsAggregator::new(config.metrics_capacity));
    let router = Arc::new(ServiceRouter::new(
        config.replica_map(),
        Arc::clone(&circuits),
        RetryConfig::default().with_base_delay(Duration::from_millis(5)),
    ));
    let service = GatewayService::new(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ResponseCache::new(config.cache_capacity)),
        circuits,
        router,
        Arc::clone(&metrics),
        Arc::new(AllowAll),
    );

    let listener = GatewayListener::bind(&config.listen_addr, service)
        .await
        .unwrap();
    let base_url = format!("http://{}", listener.local_addr());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    RunningGateway {
        base_url,
        metrics,
        _shutdown_tx: shutdown_tx,
    }
}

async fn get(url: &str) -> (StatusCode, http::HeaderMap, Bytes) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let response = client.get(url.parse().unwrap()).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxies_and_attaches_rate_headers() {
    let upstream = start_mock_upstream(|_| (StatusCode::OK, "upstream response".into())).await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 10), RouteClass::Other);
    let gateway = start_gateway(config).await;

    let (status, headers, body) = get(&format!("{}/api/content/posts", gateway.base_url)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"upstream response"));
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "9");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unmatched_path_is_404() {
    let upstream = start_mock_upstream(|_| (StatusCode::OK, "ok".into())).await;
    let config = test_config(&upstream, LimitPolicy::default(), RouteClass::Other);
    let gateway = start_gateway(config).await;

    let (status, _, body) = get(&format!("{}/nope", gateway.base_url)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quota_exhaustion_returns_429() {
    let upstream = start_mock_upstream(|_| (StatusCode::OK, "ok".into())).await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 3), RouteClass::Other);
    let gateway = start_gateway(config).await;
    let url = format!("{}/api/content/posts", gateway.base_url);

    for _ in 0..3 {
        let (status, _, _) = get(&url).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = get(&url).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.get("retry-after").is_some());
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "RATE_LIMITED");
    assert!(json["retryAfter"].as_u64().unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_content_class_get_is_cached() {
    let upstream = start_mock_upstream(|n| (StatusCode::OK, format!("version-{}", n))).await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 100), RouteClass::Content);
    let gateway = start_gateway(config).await;
    let url = format!("{}/api/content/posts", gateway.base_url);

    let (status, headers, first_body) = get(&url).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-cache").is_none());

    let (status, headers, second_body) = get(&url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-cache").unwrap(), "HIT");
    assert!(headers.contains_key("x-cache-age"));
    // Same body as the first response, not a fresh upstream render.
    assert_eq!(first_body, second_body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_failures_open_circuit_and_reject() {
    let upstream =
        start_mock_upstream(|_| (StatusCode::INTERNAL_SERVER_ERROR, "boom".into())).await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 100), RouteClass::Other);
    let gateway = start_gateway(config).await;
    let url = format!("{}/api/content/posts", gateway.base_url);

    // Each request makes up to 3 attempts; threshold 3 opens the circuit on
    // the first request's retries.
    let (status, _, _) = get(&url).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _, body) = get(&url).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Service temporarily unavailable");
    assert_eq!(json["reason"], "circuit open");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failure_is_retried() {
    // First attempt 503, then healthy.
    let upstream = start_mock_upstream(|n| {
        if n == 0 {
            (StatusCode::SERVICE_UNAVAILABLE, "warming up".into())
        } else {
            (StatusCode::OK, "recovered".into())
        }
    })
    .await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 100), RouteClass::Other);
    let gateway = start_gateway(config).await;

    let (status, _, body) = get(&format!("{}/api/content/posts", gateway.base_url)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"recovered"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_metrics_observe_gateway_traffic() {
    let upstream = start_mock_upstream(|_| (StatusCode::OK, "ok".into())).await;
    let config = test_config(&upstream, LimitPolicy::new(60_000, 100), RouteClass::Other);
    let gateway = start_gateway(config).await;
    let url = format!("{}/api/content/posts", gateway.base_url);

    for _ in 0..5 {
        get(&url).await;
    }

    let aggregate = gateway.metrics.query(Duration::from_secs(60));
    assert_eq!(aggregate.total_requests, 5);
    assert_eq!(aggregate.failure_count, 0);
    assert!(aggregate.average_latency_ms > 0.0);

    let health = gateway.metrics.health();
    assert_eq!(health.requests_last_minute, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_endpoints() {
    use edgegate::admin::AdminService;
    use edgegate::admin_listener::AdminListener;

    let metrics = Arc::new(MetricsAggregator::new(64));
    metrics.record(
        edgegate::metrics::MetricSample {
            timestamp: edgegate::store::now_millis(),
            method: "GET".to_string(),
            path: "/api/content".to_string(),
            status: 200,
            latency_ms: 4.2,
        },
        "content",
    );

    let listener = AdminListener::bind("127.0.0.1:0", AdminService::new(Arc::clone(&metrics)))
        .await
        .unwrap();
    let base_url = format!("http://{}", listener.local_addr());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    let (status, _, body) = get(&format!("{}/health", base_url)).await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["requestsLastMinute"], 1);

    let (status, _, body) = get(&format!("{}/metrics?timeRange=1h", base_url)).await;
    assert_eq!(status, StatusCode::OK);
    let aggregate: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(aggregate["totalRequests"], 1);

    let (status, _, _) = get(&format!("{}/metrics?timeRange=2w", base_url)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = get(&format!("{}/metrics/export", base_url)).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));

    drop(shutdown_tx);
}
