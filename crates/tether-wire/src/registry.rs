//! Handler registry: named callables plus transient-handler lifecycle.
//!
//! Permanent handlers are registered explicitly and live as long as the
//! endpoint. Transient handlers back function values exported as callback
//! arguments; they get a generated, prefixed name and are evicted by
//! [`HandlerRegistry::sweep`] once unused for longer than the TTL.

use crate::value::Handler;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_types::{Descriptor, EndpointConfig};
use tokio::time::Instant;
use tracing::{debug, info};

/// How long a registration lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Registered explicitly; never swept.
    Permanent,
    /// Generated for a callback; evicted when `last_used` is older than the TTL.
    Transient { last_used: Instant },
}

struct Registration {
    handler: Arc<dyn Handler>,
    lifetime: Lifetime,
}

/// Concurrent name → handler table for one endpoint.
pub struct HandlerRegistry {
    entries: DashMap<String, Registration>,
    prefix: String,
    ttl: Duration,
    rng: Mutex<StdRng>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new(prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            prefix: prefix.into(),
            ttl,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Prefix and TTL taken from `config`.
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.transient_prefix.clone(), config.transient_ttl())
    }

    /// Register a permanent handler. An existing entry with the same name is replaced.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        debug!(name = %name, "Registering handler");
        self.entries.insert(
            name,
            Registration {
                handler,
                lifetime: Lifetime::Permanent,
            },
        );
    }

    /// Register a transient handler and return the descriptor that reaches it.
    ///
    /// The generated name is both the registry key and the descriptor id.
    pub fn register_transient(&self, handler: Arc<dyn Handler>) -> Descriptor {
        let registration = Registration {
            handler,
            lifetime: Lifetime::Transient {
                last_used: Instant::now(),
            },
        };
        loop {
            let name = format!("{}{}", self.prefix, self.random_suffix());
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.entries.entry(name.clone()) {
                slot.insert(registration);
                debug!(name = %name, "Registered transient handler");
                return Descriptor::remote(name);
            }
        }
    }

    /// Fetch a handler for invocation, refreshing its liveness if transient.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let mut entry = self.entries.get_mut(name)?;
        if let Lifetime::Transient { last_used } = &mut entry.lifetime {
            *last_used = Instant::now();
        }
        Some(Arc::clone(&entry.handler))
    }

    /// Remove `name`. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// How `name` was registered. Does not refresh a transient entry.
    pub fn lifetime(&self, name: &str) -> Option<Lifetime> {
        self.entries.get(name).map(|entry| entry.lifetime)
    }

    /// Evict stale transient handlers as of now.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evict transient handlers whose last use is more than the TTL before `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut evicted = 0;
        self.entries.retain(|name, entry| match entry.lifetime {
            Lifetime::Permanent => true,
            Lifetime::Transient { last_used } => {
                let stale = now.saturating_duration_since(last_used) > ttl;
                if stale {
                    debug!(name = %name, "Evicting stale transient handler");
                    evicted += 1;
                }
                !stale
            }
        });
        if evicted > 0 {
            info!(evicted, remaining = self.entries.len(), "Transient handler sweep");
        }
        evicted
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of transient entries, stale or not.
    pub fn transient_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.lifetime, Lifetime::Transient { .. }))
            .count()
    }

    fn random_suffix(&self) -> String {
        let n: u64 = self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen();
        base36(n)
    }
}

/// Render `n` in base 36 (digits then lowercase letters).
pub(crate) fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
