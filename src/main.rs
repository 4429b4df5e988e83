mod access_log;
mod admin;
mod admin_listener;
mod auth;
mod cache;
mod circuit;
mod config;
mod error;
mod gateway;
mod listener;
mod metrics;
mod ratelimit;
mod retry;
mod router;
mod store;
mod sweep;

use std::sync::Arc;

use admin::AdminService;
use admin_listener::AdminListener;
use auth::{AllowAll, Authenticator, HttpAuthenticator};
use cache::ResponseCache;
use circuit::CircuitRegistry;
use config::{GatewayConfig, StoreBackend};
use gateway::GatewayService;
use listener::GatewayListener;
use metrics::MetricsAggregator;
use retry::RetryConfig;
use router::ServiceRouter;
use store::{CounterStore, MemoryStore, RedisStore};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting edgegate");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env()?;
    config.validate()?;
    info!(
        "config: gateway={}, admin={}, backends={}, routes={}",
        config.listen_addr,
        config.admin_addr,
        config.backends.len(),
        config.routes.len()
    );

    let store: Arc<dyn CounterStore> = match &config.store {
        StoreBackend::Memory => {
            info!("using in-process counter store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis { url } => {
            info!("using redis counter store at {}", url);
            Arc::new(RedisStore::new(url)?)
        }
    };

    let circuits = Arc::new(CircuitRegistry::with_defaults());
    for (name, backend) in &config.backends {
        for replica in &backend.replicas {
            circuits.configure(replica.name.clone(), backend.circuit.clone());
        }
        info!(backend = %name, replicas = backend.replicas.len(), "backend registered");
    }

    let cache = Arc::new(
        ResponseCache::new(config.cache_capacity).with_evict_fraction(config.evict_fraction),
    );
    let metrics = Arc::new(MetricsAggregator::new(config.metrics_capacity));
    let router = Arc::new(ServiceRouter::new(
        config.replica_map(),
        Arc::clone(&circuits),
        RetryConfig::default(),
    ));

    let authenticator: Arc<dyn Authenticator> = match &config.auth_verify_url {
        Some(url) => Arc::new(HttpAuthenticator::new(url.clone())),
        None => {
            warn!("no auth_verify_url configured, auth-required routes accept any caller");
            Arc::new(AllowAll)
        }
    };

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let service = GatewayService::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&cache),
        circuits,
        router,
        Arc::clone(&metrics),
        authenticator,
    );

    let gateway_listener = GatewayListener::bind(&config.listen_addr, service.clone()).await?;
    info!("gateway listening on {}", gateway_listener.local_addr());

    let admin_listener =
        AdminListener::bind(&config.admin_addr, AdminService::new(Arc::clone(&metrics))).await?;
    info!(
        "admin endpoints on {} (/health, /metrics, /metrics/export)",
        admin_listener.local_addr()
    );

    let sweeper = sweep::spawn_sweeper(
        store,
        cache,
        config.sweep_interval(),
        shutdown_tx.subscribe(),
    );

    let mut gateway_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = gateway_listener.serve(shutdown_rx).await {
                error!("gateway listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut gateway_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut gateway_task => {
            gateway_finished = true;
            match res {
                Ok(()) => info!("gateway task completed"),
                Err(err) => error!("gateway task join error: {}", err),
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !gateway_finished {
        match gateway_task.await {
            Ok(()) => info!("gateway task completed"),
            Err(err) => error!("gateway task join error: {}", err),
        }
    }

    if !admin_finished {
        match admin_task.await {
            Ok(()) => info!("admin task completed"),
            Err(err) => error!("admin task join error: {}", err),
        }
    }

    service.drain_background().await;
    if let Err(err) = sweeper.await {
        error!("sweeper join error: {}", err);
    }

    info!("shutdown complete");
    Ok(())
}
