//! Admin endpoints for health and metrics.

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;
use tracing::{debug, warn};

use crate::gateway::{full_body, json_response, ResponseBody};
use crate::metrics::MetricsAggregator;

/// Admin service serving:
/// - `/health` - gateway health derived from the last minute of traffic
/// - `/metrics?timeRange=5m|1h|24h` - windowed aggregate metrics as JSON
/// - `/metrics/export` - Prometheus text exposition
#[derive(Clone)]
pub struct AdminService {
    metrics: Arc<MetricsAggregator>,
}

impl AdminService {
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        Self { metrics }
    }

    async fn handle_request(
        metrics: Arc<MetricsAggregator>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ResponseBody>, Infallible> {
        let path = req.uri().path();

        match path {
            "/health" => {
                debug!("health check requested");
                let health = metrics.health();
                Ok(json_value_response(StatusCode::OK, &health))
            }
            "/metrics" => {
                let range = match parse_time_range(req.uri().query()) {
                    Some(range) => range,
                    None => {
                        return Ok(json_response(
                            StatusCode::BAD_REQUEST,
                            serde_json::json!({
                                "error": "BAD_REQUEST",
                                "message": "timeRange must be one of 5m, 1h, 24h",
                            }),
                        ));
                    }
                };
                debug!(range_secs = range.as_secs(), "metrics requested");
                let aggregate = metrics.query(range);
                Ok(json_value_response(StatusCode::OK, &aggregate))
            }
            "/metrics/export" => match metrics.encode() {
                Ok(text) => Ok(prometheus_response(text)),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    Ok(json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({
                            "error": "INTERNAL_ERROR",
                            "message": "failed to encode metrics",
                        }),
                    ))
                }
            },
            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "NOT_FOUND"}),
            )),
        }
    }
}

/// Parses the `timeRange` query parameter; absent defaults to 5 minutes.
fn parse_time_range(query: Option<&str>) -> Option<Duration> {
    let value = query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("timeRange="));

    match value {
        None | Some("5m") => Some(Duration::from_secs(5 * 60)),
        Some("1h") => Some(Duration::from_secs(60 * 60)),
        Some("24h") => Some(Duration::from_secs(24 * 60 * 60)),
        Some(_) => None,
    }
}

fn json_value_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_value(value) {
        Ok(json) => json_response(status, json),
        Err(_) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": "INTERNAL_ERROR"}),
        ),
    }
}

fn prometheus_response(text: String) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(full_body(text.into()))
        .unwrap_or_else(|_| Response::new(full_body(bytes::Bytes::new())))
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(Self::handle_request(Arc::clone(&self.metrics), req))
    }
}
