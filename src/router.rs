//! Weighted backend selection and request execution.
//!
//! The router owns the static replica topology and the outbound HTTP
//! client. Selection is weighted-random among replicas whose circuit is not
//! open; when every circuit is open the first configured replica is used as
//! a last resort, since total backend loss should still attempt delivery.
//! Every attempt's outcome is reported to the circuit registry.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitRegistry, CircuitState};
use crate::error::{GatewayError, Result};
use crate::retry::RetryConfig;

/// One addressable backend replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Unique replica name; circuit state is tracked under it.
    pub name: String,
    /// Base URL, e.g. `http://10.0.0.5:8080`.
    pub url: String,
    /// Relative selection weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Replica that served the response, when one did.
    pub backend: Option<String>,
}

impl GatewayResponse {
    /// Structured placeholder for a failed fan-out member.
    pub fn unavailable(reason: &str) -> Self {
        let body = serde_json::json!({
            "error": "Service temporarily unavailable",
            "reason": reason,
        });
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body: Bytes::from(body.to_string()),
            backend: None,
        }
    }
}

/// One member of a parallel fan-out.
#[derive(Debug, Clone)]
pub struct FanOutCall {
    pub backend: String,
    pub path_and_query: String,
    /// Higher priority executes earlier.
    pub priority: u8,
    pub base_timeout: Duration,
}

/// Outcome of one fan-out member; failures carry a 503 placeholder.
#[derive(Debug)]
pub struct FanOutResult {
    pub backend: String,
    pub path_and_query: String,
    pub response: GatewayResponse,
}

/// Routes requests to weighted backend replicas with retry and circuit
/// feedback.
pub struct ServiceRouter {
    backends: HashMap<String, Vec<Replica>>,
    circuits: Arc<CircuitRegistry>,
    client: Client<HttpConnector, Full<Bytes>>,
    retry: RetryConfig,
}

impl ServiceRouter {
    pub fn new(
        backends: HashMap<String, Vec<Replica>>,
        circuits: Arc<CircuitRegistry>,
        retry: RetryConfig,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            backends,
            circuits,
            client,
            retry,
        }
    }

    /// Replica names configured for `backend`, for circuit preflight.
    pub fn replica_names(&self, backend: &str) -> Vec<String> {
        self.backends
            .get(backend)
            .map(|replicas| replicas.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Picks a replica for `backend`. The bool is true when every circuit
    /// was open and the first replica was chosen as a last resort.
    fn select_replica(&self, backend: &str) -> Result<(Replica, bool)> {
        let replicas = self
            .backends
            .get(backend)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| GatewayError::Config(format!("unknown backend: {}", backend)))?;

        let healthy: Vec<&Replica> = replicas
            .iter()
            .filter(|r| self.circuits.effective_state(&r.name) != CircuitState::Open)
            .collect();

        if healthy.is_empty() {
            warn!(backend, "all replica circuits open, degraded fallback to first replica");
            return Ok((replicas[0].clone(), true));
        }

        Ok((Self::weighted_pick(&healthy).clone(), false))
    }

    fn weighted_pick<'a>(candidates: &[&'a Replica]) -> &'a Replica {
        let total: u64 = candidates.iter().map(|r| u64::from(r.weight.max(1))).sum();
        let mut roll = rand::thread_rng().gen_range(0..total);
        for replica in candidates {
            let weight = u64::from(replica.weight.max(1));
            if roll < weight {
                return replica;
            }
            roll -= weight;
        }
        candidates[candidates.len() - 1]
    }

    /// Forwards a request to `backend`, retrying with scaled timeouts and
    /// exponential backoff. A 5xx on the final attempt is surfaced as the
    /// backend's own response; transport errors and timeouts surface as
    /// errors once attempts are exhausted.
    pub async fn forward(
        &self,
        backend: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        base_timeout: Duration,
    ) -> Result<GatewayResponse> {
        let mut last_err = GatewayError::UpstreamUnavailable {
            backend: backend.to_string(),
        };

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay_after(attempt - 1)).await;
            }

            let (replica, last_resort) = self.select_replica(backend)?;
            if !last_resort && !self.circuits.allow(&replica.name).allowed {
                // Raced a concurrent open or an in-flight probe.
                last_err = GatewayError::CircuitOpen {
                    backend: replica.name.clone(),
                };
                continue;
            }

            let uri = build_upstream_uri(&replica.url, path_and_query)?;
            let attempt_timeout = self.retry.timeout_for(attempt, base_timeout);
            let start = Instant::now();

            let mut builder = http::Request::builder().method(method.clone()).uri(uri);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            let request = builder.body(Full::new(body.clone()))?;

            debug!(
                backend,
                replica = %replica.name,
                attempt,
                timeout_ms = attempt_timeout.as_millis() as u64,
                "forwarding request"
            );

            match timeout(attempt_timeout, self.client.request(request)).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    let failed = status.is_server_error();
                    self.circuits.report(&replica.name, !failed);

                    if failed && attempt < self.retry.max_attempts {
                        warn!(replica = %replica.name, status = status.as_u16(), attempt, "retrying after upstream error");
                        last_err = GatewayError::UpstreamError {
                            backend: replica.name.clone(),
                            message: format!("status {}", status.as_u16()),
                        };
                        continue;
                    }

                    let (parts, body) = response.into_parts();
                    let bytes = body.collect().await.map_err(GatewayError::Http)?.to_bytes();

                    info!(
                        replica = %replica.name,
                        status = status.as_u16(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "upstream request completed"
                    );

                    return Ok(GatewayResponse {
                        status,
                        headers: parts.headers,
                        body: bytes,
                        backend: Some(replica.name),
                    });
                }
                Ok(Err(e)) => {
                    warn!(replica = %replica.name, attempt, error = %e, "upstream request failed");
                    self.circuits.report(&replica.name, false);
                    last_err = GatewayError::UpstreamError {
                        backend: replica.name.clone(),
                        message: e.to_string(),
                    };
                }
                Err(_) => {
                    warn!(
                        replica = %replica.name,
                        attempt,
                        timeout_ms = attempt_timeout.as_millis() as u64,
                        "upstream request timed out"
                    );
                    self.circuits.report(&replica.name, false);
                    last_err = GatewayError::UpstreamTimeout {
                        backend: replica.name.clone(),
                        duration_ms: attempt_timeout.as_millis() as u64,
                    };
                }
            }
        }

        Err(last_err)
    }

    /// Executes aggregate calls with bounded concurrency, highest priority
    /// first. A failed member yields a 503 placeholder instead of aborting
    /// the batch.
    pub async fn fan_out(&self, mut calls: Vec<FanOutCall>, limit: usize) -> Vec<FanOutResult> {
        calls.sort_by(|a, b| b.priority.cmp(&a.priority));

        let futures = calls.into_iter().map(|call| {
            let FanOutCall {
                backend,
                path_and_query,
                base_timeout,
                ..
            } = call;
            async move {
                let response = match self
                    .forward(
                        &backend,
                        Method::GET,
                        &path_and_query,
                        &HeaderMap::new(),
                        Bytes::new(),
                        base_timeout,
                    )
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(backend = %backend, error = %e, "fan-out member failed");
                        GatewayResponse::unavailable(&e.to_string())
                    }
                };
                FanOutResult {
                    backend,
                    path_and_query,
                    response,
                }
            }
        });

        stream::iter(futures)
            .buffered(limit.max(1))
            .collect()
            .await
    }
}

/// Joins a replica base URL with the request path and query.
fn build_upstream_uri(base_url: &str, path_and_query: &str) -> Result<Uri> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    joined.parse().map_err(|e| {
        GatewayError::UpstreamError {
            backend: base_url.to_string(),
            message: format!("invalid upstream uri: {}", e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitConfig;

    fn router_with(backends: HashMap<String, Vec<Replica>>) -> ServiceRouter {
        ServiceRouter::new(
            backends,
            Arc::new(CircuitRegistry::with_defaults()),
            RetryConfig::default().without_jitter(),
        )
    }

    fn replica(name: &str, weight: u32) -> Replica {
        Replica {
            name: name.to_string(),
            url: format!("http://127.0.0.1:1/{}", name),
            weight,
        }
    }

    #[test]
    fn test_build_upstream_uri() {
        let uri = build_upstream_uri("http://10.0.0.1:8080/", "/api/items?page=2").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/api/items?page=2");
    }

    #[test]
    fn test_weighted_selection_is_proportional() {
        let backends = HashMap::from([(
            "content".to_string(),
            vec![replica("a", 1), replica("b", 3)],
        )]);
        let router = router_with(backends);

        let mut picks = HashMap::new();
        for _ in 0..10_000 {
            let (chosen, last_resort) = router.select_replica("content").unwrap();
            assert!(!last_resort);
            *picks.entry(chosen.name).or_insert(0u32) += 1;
        }

        let b_share = f64::from(picks["b"]) / 10_000.0;
        // b has 3/4 of the weight; allow generous statistical slack.
        assert!(b_share > 0.68 && b_share < 0.82, "b share was {}", b_share);
    }

    #[test]
    fn test_selection_skips_open_circuits() {
        let circuits = Arc::new(CircuitRegistry::new(CircuitConfig {
            failure_threshold: 1,
            open_timeout_ms: 60_000,
        }));
        let backends = HashMap::from([(
            "content".to_string(),
            vec![replica("a", 1), replica("b", 1)],
        )]);
        let router = ServiceRouter::new(backends, circuits.clone(), RetryConfig::default());

        circuits.report("a", false);

        for _ in 0..50 {
            let (chosen, last_resort) = router.select_replica("content").unwrap();
            assert_eq!(chosen.name, "b");
            assert!(!last_resort);
        }
    }

    #[test]
    fn test_all_open_falls_back_to_first_replica() {
        let circuits = Arc::new(CircuitRegistry::new(CircuitConfig {
            failure_threshold: 1,
            open_timeout_ms: 60_000,
        }));
        let backends = HashMap::from([(
            "content".to_string(),
            vec![replica("a", 1), replica("b", 1)],
        )]);
        let router = ServiceRouter::new(backends, circuits.clone(), RetryConfig::default());

        circuits.report("a", false);
        circuits.report("b", false);

        let (chosen, last_resort) = router.select_replica("content").unwrap();
        assert_eq!(chosen.name, "a");
        assert!(last_resort);
    }

    #[test]
    fn test_unknown_backend_errors() {
        let router = router_with(HashMap::new());
        assert!(router.select_replica("missing").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forward_exhausts_attempts_on_dead_upstream() {
        let backends = HashMap::from([(
            // Port 1 refuses connections immediately.
            "dead".to_string(),
            vec![Replica {
                name: "dead-1".to_string(),
                url: "http://127.0.0.1:1".to_string(),
                weight: 1,
            }],
        )]);
        let router = ServiceRouter::new(
            backends,
            Arc::new(CircuitRegistry::with_defaults()),
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        );

        let result = router
            .forward(
                "dead",
                Method::GET,
                "/",
                &HeaderMap::new(),
                Bytes::new(),
                Duration::from_millis(500),
            )
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::UpstreamError { .. }) | Err(GatewayError::UpstreamTimeout { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fan_out_yields_placeholders_for_failures() {
        let router = router_with(HashMap::new());

        let calls = vec![
            FanOutCall {
                backend: "missing-a".to_string(),
                path_and_query: "/a".to_string(),
                priority: 1,
                base_timeout: Duration::from_millis(100),
            },
            FanOutCall {
                backend: "missing-b".to_string(),
                path_and_query: "/b".to_string(),
                priority: 9,
                base_timeout: Duration::from_millis(100),
            },
        ];

        let results = router.fan_out(calls, 5).await;
        assert_eq!(results.len(), 2);
        // Higher priority first.
        assert_eq!(results[0].backend, "missing-b");
        for result in &results {
            assert_eq!(result.response.status, StatusCode::SERVICE_UNAVAILABLE);
            let body: serde_json::Value = serde_json::from_slice(&result.response.body).unwrap();
            assert_eq!(body["error"], "Service temporarily unavailable");
        }
    }

    #[test]
    fn test_unavailable_placeholder_shape() {
        let placeholder = GatewayResponse::unavailable("circuit open");
        assert_eq!(placeholder.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&placeholder.body).unwrap();
        assert_eq!(body["reason"], "circuit open");
    }
}
