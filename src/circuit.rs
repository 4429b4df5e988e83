//! Per-backend circuit breakers.
//!
//! Each named backend replica gets a three-state breaker:
//! - **Closed**: requests flow; failures accumulate, successes decay them.
//! - **Open**: requests are rejected until the open timeout elapses.
//! - **HalfOpen**: a single trial request probes the backend; its outcome
//!   closes or re-opens the circuit.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for a backend's breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures tolerated before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    /// How long the circuit stays open before admitting a trial request.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl CircuitConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Outcome of an admission check against a breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitDecision {
    pub allowed: bool,
    pub reason: Option<&'static str>,
}

impl CircuitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn open() -> Self {
        Self {
            allowed: false,
            reason: Some("circuit open"),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
    config: CircuitConfig,
}

impl Breaker {
    fn new(config: CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_started: None,
            config,
        }
    }

    fn open_elapsed(&self) -> bool {
        self.opened_at
            .map(|t| t.elapsed() >= self.config.open_timeout())
            .unwrap_or(true)
    }
}

/// Registry of breakers keyed by backend replica name.
pub struct CircuitRegistry {
    breakers: DashMap<String, Mutex<Breaker>>,
    default_config: CircuitConfig,
}

impl CircuitRegistry {
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitConfig::default())
    }

    /// Registers a backend with its own breaker configuration.
    ///
    /// Backends never configured explicitly get the registry default on
    /// first use.
    pub fn configure(&self, backend: impl Into<String>, config: CircuitConfig) {
        self.breakers
            .insert(backend.into(), Mutex::new(Breaker::new(config)));
    }

    /// Checks whether a request to `backend` may proceed.
    ///
    /// An open circuit whose timeout has elapsed transitions to half-open
    /// here, and the transitioning call is admitted as the single trial
    /// request; concurrent callers keep being rejected until the trial
    /// outcome is reported.
    pub fn allow(&self, backend: &str) -> CircuitDecision {
        let cell = self
            .breakers
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(Breaker::new(self.default_config.clone())));
        let mut b = cell.lock();

        match b.state {
            CircuitState::Closed => CircuitDecision::allowed(),
            CircuitState::Open => {
                if b.open_elapsed() {
                    debug!(backend, "circuit transitioning to half-open");
                    b.state = CircuitState::HalfOpen;
                    b.success_count = 0;
                    b.probe_started = Some(Instant::now());
                    CircuitDecision::allowed()
                } else {
                    CircuitDecision::open()
                }
            }
            CircuitState::HalfOpen => {
                // A trial request that never reports back must not wedge
                // the breaker; re-admit a probe after the open timeout.
                let stale = b
                    .probe_started
                    .map(|t| t.elapsed() >= b.config.open_timeout())
                    .unwrap_or(true);
                if stale {
                    b.probe_started = Some(Instant::now());
                    CircuitDecision::allowed()
                } else {
                    CircuitDecision::open()
                }
            }
        }
    }

    /// Records the outcome of one attempt against `backend`.
    pub fn report(&self, backend: &str, success: bool) {
        let cell = self
            .breakers
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(Breaker::new(self.default_config.clone())));
        let mut b = cell.lock();

        match b.state {
            CircuitState::Closed => {
                if success {
                    b.failure_count = b.failure_count.saturating_sub(1);
                } else {
                    b.failure_count += 1;
                    if b.failure_count >= b.config.failure_threshold {
                        warn!(backend, failures = b.failure_count, "circuit opened");
                        b.state = CircuitState::Open;
                        b.opened_at = Some(Instant::now());
                    }
                }
            }
            CircuitState::HalfOpen => {
                b.probe_started = None;
                if success {
                    b.success_count += 1;
                    info!(backend, "trial request succeeded, circuit closed");
                    b.state = CircuitState::Closed;
                    b.failure_count = 0;
                    b.opened_at = None;
                } else {
                    warn!(backend, "trial request failed, circuit re-opened");
                    b.state = CircuitState::Open;
                    b.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                // Late reports from attempts started before the circuit
                // opened; failures keep the open window fresh.
                if !success {
                    b.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Current state of `backend`'s breaker, accounting for an elapsed open
    /// timeout without mutating anything. Unknown backends read as closed.
    pub fn effective_state(&self, backend: &str) -> CircuitState {
        match self.breakers.get(backend) {
            Some(cell) => {
                let b = cell.lock();
                match b.state {
                    CircuitState::Open if b.open_elapsed() => CircuitState::HalfOpen,
                    other => other,
                }
            }
            None => CircuitState::Closed,
        }
    }

    /// Whether any of the named backends can currently accept a request.
    pub fn any_available(&self, backends: &[String]) -> bool {
        backends
            .iter()
            .any(|b| self.effective_state(b) != CircuitState::Open)
    }

    /// Counter snapshot for diagnostics.
    pub fn snapshot(&self, backend: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(backend).map(|cell| {
            let b = cell.lock();
            CircuitSnapshot {
                state: b.state,
                failure_count: b.failure_count,
                success_count: b.success_count,
            }
        })
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
}
