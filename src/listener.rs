//! Gateway TCP listener.
//!
//! Accepts connections until the shutdown broadcast fires and serves each
//! one on its own task. HTTP/1.1 and h2c are negotiated automatically; TLS
//! termination happens in front of the gateway and is out of scope here.

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{ClientAddr, GatewayService};

/// Listener binding the gateway pipeline to a socket.
pub struct GatewayListener {
    tcp_listener: TcpListener,
    service: GatewayService,
    addr: SocketAddr,
}

impl GatewayListener {
    /// Binds to `addr` and prepares to serve `service`.
    pub async fn bind(addr: &str, service: GatewayService) -> Result<Self> {
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

        info!("gateway bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves connections until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving gateway connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let service = self.service.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |mut req: Request<Incoming>| {
                                    req.extensions_mut().insert(ClientAddr(peer_addr.ip()));
                                    let mut service = service.clone();
                                    async move { service.call(req).await }
                                });

                                let result = auto::Builder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await;
                                if let Err(e) = result {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping gateway listener");
                    break;
                }
            }
        }

        Ok(())
    }
}
