//! External authentication seam.
//!
//! The gateway never validates credentials itself; routes that require
//! authentication delegate to an [`Authenticator`]. A failed or unreachable
//! check reads as unauthenticated (the route is denied, the gateway keeps
//! running).

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of an external credential check.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub authenticated: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl AuthOutcome {
    pub fn denied() -> Self {
        Self::default()
    }
}

/// External authentication check.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies a bearer token. Never errors: any failure is a denial.
    async fn verify(&self, token: &str) -> AuthOutcome;
}

/// Calls the auth service's verify endpoint over HTTP.
pub struct HttpAuthenticator {
    client: Client<HttpConnector, Full<Bytes>>,
    verify_url: String,
    timeout: Duration,
}

impl HttpAuthenticator {
    pub fn new(verify_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            verify_url: verify_url.into(),
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn verify(&self, token: &str) -> AuthOutcome {
        if token.is_empty() {
            return AuthOutcome::denied();
        }

        let request = match http::Request::builder()
            .method(http::Method::GET)
            .uri(&self.verify_url)
            .header(http::header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Full::new(Bytes::new()))
        {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "failed to build auth verify request");
                return AuthOutcome::denied();
            }
        };

        let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "auth verify request failed");
                return AuthOutcome::denied();
            }
            Err(_) => {
                warn!("auth verify request timed out");
                return AuthOutcome::denied();
            }
        };

        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "auth verify rejected");
            return AuthOutcome::denied();
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read auth verify response");
                return AuthOutcome::denied();
            }
        };

        serde_json::from_slice(&body).unwrap_or_else(|e| {
            warn!(error = %e, "unparseable auth verify response");
            AuthOutcome::denied()
        })
    }
}

/// Accepts every request; for development and tests.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn verify(&self, token: &str) -> AuthOutcome {
        AuthOutcome {
            authenticated: true,
            user_id: Some(format!("dev-{}", token)),
            role: None,
        }
    }
}
