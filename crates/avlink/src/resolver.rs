//! Cached logical-name to address resolution.
//!
//! # Cache semantics
//!
//! - An entry younger than its TTL is served without touching the directory.
//! - Concurrent misses for the same name share one directory query.
//! - When the directory fails, an expired entry is served as a last resort
//!   and flagged `stale`; with no entry at all resolution fails.
//!
//! # Panic-Free Guarantees
//!
//! Lock poisoning is recovered with `PoisonError::into_inner`; no method
//! panics.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use avlink_core::collaborator::PeerDirectory;
use avlink_core::LinkConfig;

use crate::error::{OperatorError, Result};

/// Cache entry for one logical peer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: IpAddr,
    pub resolved_at: Instant,
    pub ttl: Duration,
}

impl ResolvedAddress {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.resolved_at) < self.ttl
    }
}

/// Result of a `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub address: IpAddr,
    /// True when the directory failed and an expired entry was served.
    pub stale: bool,
}

/// Resolver with a TTL cache in front of a `PeerDirectory`.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct AddressResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    directory: Arc<dyn PeerDirectory>,
    ttl: Duration,
    resolve_timeout: Duration,
    cache: RwLock<HashMap<String, ResolvedAddress>>,
    /// Per-name gates so only one directory query runs per name.
    in_flight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressResolver {
    pub fn new(directory: Arc<dyn PeerDirectory>, config: &LinkConfig) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                directory,
                ttl: config.resolver_ttl,
                resolve_timeout: config.resolve_timeout,
                cache: RwLock::new(HashMap::new()),
                in_flight: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolves `name` to an address.
    ///
    /// A literal IP address is returned as-is without consulting the
    /// directory or the cache.
    pub async fn resolve(&self, name: &str) -> Result<Resolved> {
        if let Ok(address) = name.parse::<IpAddr>() {
            return Ok(Resolved {
                address,
                stale: false,
            });
        }

        if let Some(entry) = self.fresh(name) {
            debug!(name, address = %entry.address, "Address cache hit");
            return Ok(Resolved {
                address: entry.address,
                stale: false,
            });
        }

        let gate = self.gate(name);
        let _flight = gate.gate.lock().await;

        // Another caller may have finished the query while we waited.
        if let Some(entry) = self.fresh(name) {
            debug!(name, address = %entry.address, "Address resolved by concurrent query");
            return Ok(Resolved {
                address: entry.address,
                stale: false,
            });
        }
        self.query(name).await
    }

    /// Drops the cache entry for `name`.
    pub fn invalidate(&self, name: &str) {
        let mut cache = self
            .inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if cache.remove(name).is_some() {
            debug!(name, "Address cache entry invalidated");
        }
    }

    /// Resolves `names` concurrently in the background.
    ///
    /// Failures are logged, never returned. The caller may await the handle
    /// or drop it.
    pub fn preload<I, S>(&self, names: I) -> JoinHandle<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let resolver = self.clone();

        tokio::spawn(async move {
            let lookups = names.iter().map(|name| {
                let resolver = resolver.clone();
                async move {
                    match resolver.resolve(name).await {
                        Ok(resolved) => {
                            debug!(name = %name, address = %resolved.address, "Preloaded address")
                        }
                        Err(e) => warn!(name = %name, error = %e, "Address preload failed"),
                    }
                }
            });
            join_all(lookups).await;
        })
    }

    /// Returns the cache entry for `name`, fresh or not.
    pub fn cached(&self, name: &str) -> Option<ResolvedAddress> {
        let cache = self
            .inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        cache.get(name).copied()
    }

    /// Returns the cache entry for `name` if it is younger than its TTL.
    pub fn fresh(&self, name: &str) -> Option<ResolvedAddress> {
        self.cached(name).filter(|entry| entry.is_fresh(Instant::now()))
    }

    async fn query(&self, name: &str) -> Result<Resolved> {
        let failure = match timeout(self.inner.resolve_timeout, self.inner.directory.resolve(name))
            .await
        {
            Ok(Ok(Some(address))) => {
                self.store(name, address);
                info!(name, %address, "Resolved peer address");
                return Ok(Resolved {
                    address,
                    stale: false,
                });
            }
            Ok(Ok(None)) => "peer not found in directory".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "directory query timed out after {}ms",
                self.inner.resolve_timeout.as_millis()
            ),
        };

        match self.cached(name) {
            Some(entry) => {
                warn!(
                    name,
                    address = %entry.address,
                    reason = %failure,
                    "Directory query failed, using stale cached address"
                );
                Ok(Resolved {
                    address: entry.address,
                    stale: true,
                })
            }
            None => Err(OperatorError::Resolution {
                name: name.to_string(),
                reason: failure,
            }),
        }
    }

    fn store(&self, name: &str, address: IpAddr) {
        let entry = ResolvedAddress {
            address,
            resolved_at: Instant::now(),
            ttl: self.inner.ttl,
        };
        let mut cache = self
            .inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        cache.insert(name.to_string(), entry);
    }

    fn gate<'a>(&'a self, name: &'a str) -> GateGuard<'a> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let gate = Arc::clone(in_flight.entry(name.to_string()).or_default());
        GateGuard {
            resolver: self,
            name,
            gate,
        }
    }

    fn release_gate(&self, name: &str, gate: &Arc<Mutex<()>>) {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = in_flight.get(name).is_some_and(|g| Arc::ptr_eq(g, gate));
        // Only the map and this caller hold it: nobody else is waiting.
        if current && Arc::strong_count(gate) <= 2 {
            in_flight.remove(name);
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A caller's share of a per-name gate. Released on drop, so a cancelled
/// `resolve` leaves no entry behind.
struct GateGuard<'a> {
    resolver: &'a AddressResolver,
    name: &'a str,
    gate: Arc<Mutex<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.resolver.release_gate(self.name, &self.gate);
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use avlink_core::error::CollaboratorResult;

    struct Unreachable;

    #[async_trait]
    impl PeerDirectory for Unreachable {
        async fn resolve(&self, _name: &str) -> CollaboratorResult<Option<IpAddr>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_literal_address_bypasses_directory() {
        let resolver = AddressResolver::new(Arc::new(Unreachable), &LinkConfig::default());
        let resolved = resolver.resolve("100.64.0.7").await.unwrap();
        assert_eq!(resolved.address, "100.64.0.7".parse::<IpAddr>().unwrap());
        assert!(!resolved.stale);
        assert!(resolver.cached("100.64.0.7").is_none());
    }

    #[tokio::test]
    async fn test_not_found_without_cache_is_resolution_error() {
        let resolver = AddressResolver::new(Arc::new(Unreachable), &LinkConfig::default());
        let err = resolver.resolve("reception").await.unwrap_err();
        assert!(matches!(err, OperatorError::Resolution { .. }));
    }

    #[test]
    fn test_entry_freshness_boundary() {
        let now = Instant::now();
        let entry = ResolvedAddress {
            address: "100.64.0.7".parse().unwrap(),
            resolved_at: now,
            ttl: Duration::from_secs(300),
        };
        assert!(entry.is_fresh(now));
        assert!(entry.is_fresh(now + Duration::from_secs(299)));
        assert!(!entry.is_fresh(now + Duration::from_secs(300)));
    }

    /// Answers after a delay, counting queries.
    struct SlowDirectory {
        delay: Duration,
        queries: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PeerDirectory for SlowDirectory {
        async fn resolve(&self, _name: &str) -> CollaboratorResult<Option<IpAddr>> {
            self.queries.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Some("100.64.0.7".parse().unwrap()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_resolve_releases_gate() {
        let directory = Arc::new(SlowDirectory {
            delay: Duration::from_secs(1),
            queries: Default::default(),
        });
        let config = LinkConfig {
            resolve_timeout: Duration::from_secs(5),
            ..LinkConfig::default()
        };
        let resolver = AddressResolver::new(directory.clone(), &config);

        let abandoned = timeout(Duration::from_millis(10), resolver.resolve("reception")).await;
        assert!(abandoned.is_err());
        assert_eq!(resolver.in_flight_len(), 0);

        let resolved = resolver.resolve("reception").await.unwrap();
        assert_eq!(resolved.address, "100.64.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(resolver.in_flight_len(), 0);
        assert_eq!(directory.queries.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_ignores_expired_entry() {
        let directory = Arc::new(SlowDirectory {
            delay: Duration::ZERO,
            queries: Default::default(),
        });
        let config = LinkConfig {
            resolver_ttl: Duration::from_secs(60),
            ..LinkConfig::default()
        };
        let resolver = AddressResolver::new(directory, &config);
        resolver.resolve("reception").await.unwrap();
        assert!(resolver.fresh("reception").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(resolver.fresh("reception").is_none());
        assert!(resolver.cached("reception").is_some());
    }
}
