//! Error types for the gateway core.

use std::io;
use thiserror::Error;

/// Errors that can occur while admitting, routing, or caching a request.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Failed to bind a listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// The admission key exceeded its quota.
    #[error("rate limit exceeded for key {key}")]
    RateLimited { key: String, retry_after_secs: u64 },

    /// The circuit for a backend is open; the request was rejected upfront.
    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    /// An upstream attempt exceeded its per-attempt timeout.
    #[error("upstream {backend} timed out after {duration_ms}ms")]
    UpstreamTimeout { backend: String, duration_ms: u64 },

    /// An upstream attempt failed at the transport level.
    #[error("upstream {backend} error: {message}")]
    UpstreamError { backend: String, message: String },

    /// No replica could be reached, including the last-resort fallback.
    #[error("no upstream replica available for backend {backend}")]
    UpstreamUnavailable { backend: String },

    /// A stored cache entry could not be decoded.
    #[error("cache entry corrupt: {reason}")]
    CacheCorruption { reason: String },

    /// The counter store or cache backing is unreachable.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid static configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No route class matches the request path.
    #[error("no route found for path: {path}")]
    RouteNotFound { path: String },

    /// The external authentication check rejected the request.
    #[error("authentication rejected")]
    Unauthorized,

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed HTTP message while building a request or response.
    #[error("invalid http message: {0}")]
    HttpBuild(#[from] http::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
