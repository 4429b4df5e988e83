//! Rolling-window request metrics.
//!
//! Samples land in a bounded ring buffer; aggregates are computed on demand
//! by filtering the buffer to the requested window, so no per-window state
//! is maintained. The same recording path feeds a Prometheus registry for
//! scrape-based export. One aggregator instance is constructed at startup
//! and injected wherever it is needed.

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::Duration;

use crate::store::now_millis;

/// One observed request.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// Completion time, epoch ms.
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: f64,
}

/// Labels for the Prometheus request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub status: String,
    pub route: String,
}

/// Per-endpoint aggregate over a query window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMetrics {
    pub count: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub last_seen: String,
}

/// Windowed aggregate over the sample buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub time_range_secs: u64,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_latency_ms: f64,
    pub requests_per_second: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub endpoints: BTreeMap<String, EndpointMetrics>,
}

/// Gateway health derived from the last minute of traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: String,
    pub requests_last_minute: u64,
    pub errors_last_minute: u64,
    pub error_rate: f64,
    pub average_response_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Error-rate threshold above which the gateway reports itself degraded.
const DEGRADED_ERROR_RATE: f64 = 0.10;

/// Bounded-memory metrics collector and aggregator.
pub struct MetricsAggregator {
    samples: Mutex<VecDeque<MetricSample>>,
    capacity: usize,
    registry: Registry,
    requests_total: Family<HttpLabels, Counter>,
    request_duration_seconds: Family<HttpLabels, Histogram>,
}

impl MetricsAggregator {
    /// Creates an aggregator retaining at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total number of HTTP requests",
            requests_total.clone(),
        );

        let request_duration_seconds = Family::<HttpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 10))
        });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
            request_duration_seconds.clone(),
        );

        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            registry,
            requests_total,
            request_duration_seconds,
        }
    }

    /// Records a sample, evicting the oldest once the buffer is full, and
    /// feeds the Prometheus families.
    pub fn record(&self, sample: MetricSample, route: &str) {
        let labels = HttpLabels {
            method: sample.method.clone(),
            status: sample.status.to_string(),
            route: route.to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(sample.latency_ms / 1_000.0);

        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Aggregates all samples inside `now − range`.
    pub fn query(&self, range: Duration) -> AggregateMetrics {
        let cutoff = now_millis().saturating_sub(range.as_millis() as u64);
        let samples = self.samples.lock();

        let mut total = 0u64;
        let mut failures = 0u64;
        let mut latency_sum = 0f64;
        let mut status_codes: BTreeMap<u16, u64> = BTreeMap::new();

        struct EndpointAccum {
            count: u64,
            latency_sum: f64,
            successes: u64,
            last_seen: u64,
        }
        let mut endpoints: BTreeMap<String, EndpointAccum> = BTreeMap::new();

        for sample in samples.iter().filter(|s| s.timestamp >= cutoff) {
            total += 1;
            latency_sum += sample.latency_ms;
            *status_codes.entry(sample.status).or_insert(0) += 1;
            let failed = sample.status >= 500;
            if failed {
                failures += 1;
            }

            let key = format!("{} {}", sample.method, sample.path);
            let accum = endpoints.entry(key).or_insert(EndpointAccum {
                count: 0,
                latency_sum: 0.0,
                successes: 0,
                last_seen: 0,
            });
            accum.count += 1;
            accum.latency_sum += sample.latency_ms;
            if !failed {
                accum.successes += 1;
            }
            accum.last_seen = accum.last_seen.max(sample.timestamp);
        }

        let range_secs = range.as_secs().max(1);
        AggregateMetrics {
            time_range_secs: range_secs,
            total_requests: total,
            success_count: total - failures,
            failure_count: failures,
            average_latency_ms: if total > 0 {
                latency_sum / total as f64
            } else {
                0.0
            },
            requests_per_second: total as f64 / range_secs as f64,
            status_codes,
            endpoints: endpoints
                .into_iter()
                .map(|(key, accum)| {
                    (
                        key,
                        EndpointMetrics {
                            count: accum.count,
                            average_latency_ms: accum.latency_sum / accum.count as f64,
                            success_rate: accum.successes as f64 / accum.count as f64,
                            last_seen: iso8601(accum.last_seen),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Health over the last minute. No traffic reads as healthy.
    pub fn health(&self) -> HealthReport {
        let aggregate = self.query(Duration::from_secs(60));
        let error_rate = if aggregate.total_requests > 0 {
            aggregate.failure_count as f64 / aggregate.total_requests as f64
        } else {
            0.0
        };

        HealthReport {
            status: if error_rate >= DEGRADED_ERROR_RATE {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            timestamp: iso8601(now_millis()),
            requests_last_minute: aggregate.total_requests,
            errors_last_minute: aggregate.failure_count,
            error_rate,
            average_response_time: aggregate.average_latency_ms,
        }
    }

    /// Encodes the Prometheus registry in text exposition format.
    pub fn encode(&self) -> Result<String, io::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;
        Ok(buffer)
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

fn iso8601(epoch_ms: u64) -> String {
    Utc.timestamp_millis_opt(epoch_ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
