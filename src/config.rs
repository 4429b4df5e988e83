//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file (path via `GATEWAY_CONFIG`) with
//! environment-variable overrides for the addresses, then validated before
//! any listener binds. Malformed static configuration is fatal at startup;
//! an unroutable request path at runtime is just a 404.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CachePolicy, CacheStrategy};
use crate::circuit::CircuitConfig;
use crate::ratelimit::LimitPolicy;
use crate::router::Replica;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    #[error("invalid admin address '{addr}': {reason}")]
    InvalidAdminAddr { addr: String, reason: String },

    #[error("listen address and admin address cannot be the same: {addr}")]
    DuplicateAddrs { addr: String },

    #[error("backend '{backend}' has no replicas")]
    NoReplicas { backend: String },

    #[error("invalid replica url '{url}' for backend '{backend}': {reason}")]
    InvalidReplicaUrl {
        backend: String,
        url: String,
        reason: String,
    },

    #[error("route '{route}' references unknown backend '{backend}'")]
    UnknownBackend { route: String, backend: String },

    #[error("route '{route}' is invalid: {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Request class a route belongs to; drives the default cache policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    Analytics,
    Content,
    Identity,
    #[default]
    Other,
}

/// One backend service with its replicas and breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub circuit: CircuitConfig,
}

/// One route class: a path prefix mapped to a backend plus its policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name, used in logs and metric labels.
    pub name: String,
    /// Requests whose path starts with this prefix match the route; the
    /// longest matching prefix wins.
    pub path_prefix: String,
    /// Backend the route forwards to.
    pub backend: String,
    #[serde(default)]
    pub class: RouteClass,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub limit: LimitPolicy,
    /// Base per-attempt upstream timeout; retries scale it up.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    /// Cache TTL override in milliseconds (class default otherwise).
    pub cache_ttl_ms: Option<u64>,
    /// Cache strategy override (class default otherwise).
    pub cache_strategy: Option<CacheStrategy>,
}

fn default_base_timeout_ms() -> u64 {
    5_000
}

impl RouteConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    /// Effective cache policy: the class default with any per-route
    /// overrides applied. `None` means the route is not cached.
    pub fn cache_policy(&self) -> Option<CachePolicy> {
        let mut policy = CachePolicy::for_class(self.class)?;
        if let Some(ttl_ms) = self.cache_ttl_ms {
            policy = policy.with_ttl(Duration::from_millis(ttl_ms));
        }
        if let Some(strategy) = self.cache_strategy {
            policy = policy.with_strategy(strategy);
        }
        Some(policy)
    }
}

/// Which counter store backs rate limiting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local map; suitable for a single instance.
    #[default]
    Memory,
    /// Shared Redis instance; counters are visible to all gateway replicas.
    Redis { url: String },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    #[serde(default)]
    pub store: StoreBackend,
    /// External auth service verify endpoint; unset means auth-required
    /// routes are denied.
    pub auth_verify_url: Option<String>,
    /// Whether forwarded-for headers are trusted for client IPs.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Fraction of cache entries evicted under capacity pressure.
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    pub backends: HashMap<String, BackendConfig>,
    pub routes: Vec<RouteConfig>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_evict_fraction() -> f64 {
    0.25
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_metrics_capacity() -> usize {
    10_000
}

impl GatewayConfig {
    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads configuration from `GATEWAY_CONFIG` (falling back to a sample
    /// topology) and applies address overrides from the environment.
    ///
    /// # Environment Variables
    ///
    /// * `GATEWAY_CONFIG` - Path to the TOML configuration file
    /// * `GATEWAY_LISTEN_ADDR` - Gateway listen address override
    /// * `GATEWAY_ADMIN_ADDR` - Admin listen address override
    /// * `GATEWAY_REDIS_URL` - Switches the counter store to Redis
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("GATEWAY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::sample(),
        };

        if let Ok(addr) = env::var("GATEWAY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(addr) = env::var("GATEWAY_ADMIN_ADDR") {
            config.admin_addr = addr;
        }
        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            config.store = StoreBackend::Redis { url };
        }

        Ok(config)
    }

    /// A representative single-host topology used when no file is given.
    pub fn sample() -> Self {
        let backends = HashMap::from([
            (
                "auth".to_string(),
                BackendConfig {
                    replicas: vec![Replica {
                        name: "auth-1".to_string(),
                        url: "http://127.0.0.1:8081".to_string(),
                        weight: 1,
                    }],
                    circuit: CircuitConfig::default(),
                },
            ),
            (
                "content".to_string(),
                BackendConfig {
                    replicas: vec![
                        Replica {
                            name: "content-1".to_string(),
                            url: "http://127.0.0.1:8082".to_string(),
                            weight: 2,
                        },
                        Replica {
                            name: "content-2".to_string(),
                            url: "http://127.0.0.1:8083".to_string(),
                            weight: 1,
                        },
                    ],
                    circuit: CircuitConfig::default(),
                },
            ),
            (
                "analytics".to_string(),
                BackendConfig {
                    replicas: vec![Replica {
                        name: "analytics-1".to_string(),
                        url: "http://127.0.0.1:8084".to_string(),
                        weight: 1,
                    }],
                    circuit: CircuitConfig::default(),
                },
            ),
        ]);

        let routes = vec![
            RouteConfig {
                name: "identity".to_string(),
                path_prefix: "/api/auth/me".to_string(),
                backend: "auth".to_string(),
                class: RouteClass::Identity,
                requires_auth: true,
                limit: LimitPolicy::new(60_000, 60),
                base_timeout_ms: 2_000,
                cache_ttl_ms: None,
                cache_strategy: None,
            },
            RouteConfig {
                name: "auth".to_string(),
                path_prefix: "/api/auth".to_string(),
                backend: "auth".to_string(),
                class: RouteClass::Other,
                requires_auth: false,
                limit: LimitPolicy::new(60_000, 20).with_progressive_delay(true),
                base_timeout_ms: 2_000,
                cache_ttl_ms: None,
                cache_strategy: None,
            },
            RouteConfig {
                name: "content".to_string(),
                path_prefix: "/api/content".to_string(),
                backend: "content".to_string(),
                class: RouteClass::Content,
                requires_auth: false,
                limit: LimitPolicy::new(60_000, 300),
                base_timeout_ms: 5_000,
                cache_ttl_ms: None,
                cache_strategy: None,
            },
            RouteConfig {
                name: "analytics".to_string(),
                path_prefix: "/api/analytics".to_string(),
                backend: "analytics".to_string(),
                class: RouteClass::Analytics,
                requires_auth: true,
                limit: LimitPolicy::new(60_000, 120),
                base_timeout_ms: 8_000,
                cache_ttl_ms: None,
                cache_strategy: None,
            },
        ];

        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            store: StoreBackend::Memory,
            auth_verify_url: Some("http://127.0.0.1:8081/verify".to_string()),
            trust_forwarded_for: false,
            cache_capacity: default_cache_capacity(),
            evict_fraction: default_evict_fraction(),
            sweep_interval_ms: default_sweep_interval_ms(),
            metrics_capacity: default_metrics_capacity(),
            backends,
            routes,
        }
    }

    /// Validates the configuration. Called once at startup; failures are
    /// fatal there.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        self.admin_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidAdminAddr {
                addr: self.admin_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.listen_addr == self.admin_addr {
            return Err(ConfigError::DuplicateAddrs {
                addr: self.listen_addr.clone(),
            });
        }

        for (name, backend) in &self.backends {
            if backend.replicas.is_empty() {
                return Err(ConfigError::NoReplicas {
                    backend: name.clone(),
                });
            }
            for replica in &backend.replicas {
                if !replica.url.starts_with("http://") && !replica.url.starts_with("https://") {
                    return Err(ConfigError::InvalidReplicaUrl {
                        backend: name.clone(),
                        url: replica.url.clone(),
                        reason: "must start with http:// or https://".to_string(),
                    });
                }
                if url::Url::parse(&replica.url).is_err() {
                    return Err(ConfigError::InvalidReplicaUrl {
                        backend: name.clone(),
                        url: replica.url.clone(),
                        reason: "invalid URL format".to_string(),
                    });
                }
            }
        }

        for route in &self.routes {
            if !self.backends.contains_key(&route.backend) {
                return Err(ConfigError::UnknownBackend {
                    route: route.name.clone(),
                    backend: route.backend.clone(),
                });
            }
            if route.path_prefix.is_empty() || !route.path_prefix.starts_with('/') {
                return Err(ConfigError::InvalidRoute {
                    route: route.name.clone(),
                    reason: "path_prefix must start with '/'".to_string(),
                });
            }
            if route.limit.window_ms == 0 {
                return Err(ConfigError::InvalidRoute {
                    route: route.name.clone(),
                    reason: "limit window must be greater than zero".to_string(),
                });
            }
            if route.base_timeout_ms == 0 {
                return Err(ConfigError::InvalidRoute {
                    route: route.name.clone(),
                    reason: "base timeout must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Resolves the route for a request path: longest matching prefix wins.
    pub fn resolve_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|r| path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len())
    }

    /// Replica topology keyed by backend name, for the router.
    pub fn replica_map(&self) -> HashMap<String, Vec<Replica>> {
        self.backends
            .iter()
            .map(|(name, backend)| (name.clone(), backend.replicas.clone()))
            .collect()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1_000))
    }
}
