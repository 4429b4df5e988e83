//! Content-aware response cache.
//!
//! Entries are keyed by a digest of method, path, query string, and caller
//! identity, so personalized responses never leak across principals. Each
//! route class maps to a policy (TTL, strategy, compression); stale
//! stale-while-revalidate hits are served immediately while the caller
//! triggers a detached refresh. When the store outgrows its capacity the
//! least-recently-accessed quarter of entries is dropped.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RouteClass;
use crate::store::now_millis;

/// How a cached entry interacts with the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve from cache when fresh; go to the network on a miss.
    CacheFirst,
    /// Go to the network first; fall back to the cache on failure.
    NetworkFirst,
    /// Serve even stale entries immediately and refresh in the background.
    StaleWhileRevalidate,
}

/// Per-route-class caching policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// Extra serve-stale window beyond `ttl` (stale-while-revalidate only).
    pub grace: Duration,
    pub strategy: CacheStrategy,
    pub compress: bool,
    /// Only cache 2xx responses.
    pub only_success: bool,
}

impl CachePolicy {
    /// Default policy for a route class; `None` means the class is not cached.
    pub fn for_class(class: RouteClass) -> Option<Self> {
        match class {
            RouteClass::Analytics => Some(Self {
                ttl: Duration::from_secs(60),
                grace: Duration::from_secs(60),
                strategy: CacheStrategy::StaleWhileRevalidate,
                compress: true,
                only_success: true,
            }),
            RouteClass::Content => Some(Self {
                ttl: Duration::from_secs(300),
                grace: Duration::ZERO,
                strategy: CacheStrategy::CacheFirst,
                compress: false,
                only_success: true,
            }),
            RouteClass::Identity => Some(Self {
                ttl: Duration::from_secs(30),
                grace: Duration::ZERO,
                strategy: CacheStrategy::NetworkFirst,
                compress: false,
                only_success: true,
            }),
            RouteClass::Other => None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Builds the cache key digest for a request.
///
/// Identity is always part of the key so a personalized GET can never be
/// served to a different caller.
pub fn cache_key(method: &str, path: &str, query: &str, principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(query.as_bytes());
    hasher.update(b"\n");
    hasher.update(principal.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)
}

#[derive(Debug, Clone)]
struct CachedResponse {
    body: Bytes,
    status: u16,
    headers: Vec<(String, String)>,
    created_at: u64,
    stale_at: u64,
    expires_at: u64,
    strategy: CacheStrategy,
    tags: Vec<String>,
    compressed: bool,
    last_access: u64,
}

/// A successful cache lookup, body already decoded.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub body: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Entry age, for the `X-Cache-Age` header.
    pub age: Duration,
    /// Whether the caller should trigger a background refresh.
    pub needs_refresh: bool,
}

/// Size-bounded response cache with approximate-LRU eviction.
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    capacity: usize,
    evict_fraction: f64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            evict_fraction: 0.25,
        }
    }

    /// Overrides the fraction of entries dropped under capacity pressure.
    pub fn with_evict_fraction(mut self, fraction: f64) -> Self {
        self.evict_fraction = fraction.clamp(0.05, 0.5);
        self
    }

    /// Looks up an entry, decoding the body and updating access recency.
    ///
    /// Expired and corrupt entries are removed and reported as misses.
    pub fn lookup(&self, key: &str) -> Option<CacheHit> {
        let now = now_millis();
        let hit = {
            let mut entry = self.entries.get_mut(key)?;
            if now > entry.expires_at {
                None
            } else {
                entry.last_access = now;
                Some(entry.clone())
            }
        };

        let entry = match hit {
            Some(entry) => entry,
            None => {
                self.entries.remove(key);
                return None;
            }
        };

        let body = if entry.compressed {
            match gunzip(&entry.body) {
                Ok(decoded) => Bytes::from(decoded),
                Err(e) => {
                    // Corrupt entry: recover locally by treating it as a miss.
                    warn!(key, error = %e, "corrupt cache entry dropped");
                    self.entries.remove(key);
                    return None;
                }
            }
        } else {
            entry.body.clone()
        };

        Some(CacheHit {
            body,
            status: entry.status,
            headers: entry.headers.clone(),
            age: Duration::from_millis(now.saturating_sub(entry.created_at)),
            needs_refresh: entry.strategy == CacheStrategy::StaleWhileRevalidate
                && now > entry.stale_at,
        })
    }

    /// Stores a response under `key` according to `policy`.
    pub fn store(
        &self,
        key: String,
        status: u16,
        headers: Vec<(String, String)>,
        body: &Bytes,
        policy: &CachePolicy,
        tags: Vec<String>,
    ) {
        if policy.only_success && !(200..300).contains(&status) {
            return;
        }

        let now = now_millis();
        let stale_at = now + policy.ttl.as_millis() as u64;
        let expires_at = stale_at + policy.grace.as_millis() as u64;

        let (body, compressed) = if policy.compress {
            match gzip(body) {
                Ok(encoded) => (Bytes::from(encoded), true),
                Err(e) => {
                    warn!(key, error = %e, "compression failed, storing uncompressed");
                    (body.clone(), false)
                }
            }
        } else {
            (body.clone(), false)
        };

        self.entries.insert(
            key,
            CachedResponse {
                body,
                status,
                headers,
                created_at: now,
                stale_at,
                expires_at,
                strategy: policy.strategy,
                tags,
                compressed,
                last_access: now,
            },
        );

        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Removes every entry carrying `tag`.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !e.tags.iter().any(|t| t == tag));
        before - self.entries.len()
    }

    /// Drops the least-recently-accessed share of entries, never all of them.
    fn evict(&self) {
        let mut by_recency: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_access))
            .collect();
        if by_recency.len() <= 1 {
            return;
        }
        by_recency.sort_by_key(|(_, last_access)| *last_access);

        let target = ((by_recency.len() as f64 * self.evict_fraction).ceil() as usize)
            .min(by_recency.len() - 1)
            .max(1);
        for (key, _) in by_recency.into_iter().take(target) {
            self.entries.remove(&key);
        }
        debug!(evicted = target, remaining = self.entries.len(), "cache pressure eviction");
    }

    /// Removes expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at >= now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
