//! Admin listener for health and metrics endpoints.
//!
//! Runs on a separate port so operational traffic never competes with the
//! gateway's own admission pipeline.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::admin::AdminService;
use crate::error::{GatewayError, Result};

/// Admin HTTP listener.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin surface to `addr`.
    pub async fn bind(addr: &str, admin_service: AdminService) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoint bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            admin_service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("admin connection from {}", peer_addr);
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(GatewayError::Http)
    }
}
