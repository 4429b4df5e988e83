//! Structured access-log records.
//!
//! Records are emitted fire-and-forget through `tracing` under the
//! `access` target; the subscriber (or an external sink behind it) decides
//! where they land. Nothing in the request path ever awaits the sink.

use serde::Serialize;
use tracing::info;

/// One access-log entry, emitted at request completion.
#[derive(Debug, Serialize)]
pub struct AccessRecord {
    pub timestamp: String,
    pub request_id: String,
    pub route: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: f64,
    pub backend: Option<String>,
}

/// Emits a record to the access-log target.
pub fn emit(record: &AccessRecord) {
    info!(
        target: "access",
        timestamp = %record.timestamp,
        request_id = %record.request_id,
        route = %record.route,
        client_ip = %record.client_ip,
        method = %record.method,
        path = %record.path,
        status = record.status,
        latency_ms = record.latency_ms,
        backend = record.backend.as_deref().unwrap_or("-"),
        "request completed"
    );
}
