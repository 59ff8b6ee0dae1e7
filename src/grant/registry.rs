use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::GrantError;
use crate::time::SharedClock;

use super::{Expiration, Grant, GrantDuration, GrantPolicy, GrantToken};

/// Why a resource left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// The holder cancelled it.
    Cancelled,
    /// Its grant lapsed.
    Expired,
    /// The owning component evicted it after a delivery failure.
    Revoked,
}

/// Called after a resource has been removed, outside any registry lock.
pub type RemovalHook<R> = Box<dyn Fn(GrantToken, &R, RemovalReason) + Send + Sync>;

struct GrantEntry<R> {
    resource: R,
    expiration: Expiration,
    issued: u64,
}

/// Concurrent store of granted resources keyed by token.
///
/// Validity is checked lazily: an expired entry may still be physically
/// present, but every query treats it as absent.
pub struct GrantRegistry<R> {
    entries: DashMap<GrantToken, GrantEntry<R>>,
    policy: Arc<dyn GrantPolicy>,
    clock: SharedClock,
    issued: AtomicU64,
    on_removed: RwLock<Option<RemovalHook<R>>>,
}

impl<R> fmt::Debug for GrantRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantRegistry")
            .field("entries", &self.entries.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<R> GrantRegistry<R> {
    /// Create an empty registry.
    pub fn new(policy: Arc<dyn GrantPolicy>, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock,
            issued: AtomicU64::new(0),
            on_removed: RwLock::new(None),
        }
    }

    /// Install the removal notification for the owning component.
    pub fn set_removal_hook(&self, hook: RemovalHook<R>) {
        *self.on_removed.write() = Some(hook);
    }

    /// The clock this registry judges expiry by.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Issue a grant for `resource`.
    ///
    /// # Errors
    /// Whatever the policy rejects (`InvalidDuration`, `GrantDenied`).
    pub fn grant(&self, resource: R, requested: GrantDuration) -> Result<Grant, GrantError> {
        let expiration = self.policy.expiration(self.clock.now(), requested)?;
        let token = GrantToken::new();
        self.insert(token, resource, expiration);
        debug!(token = %token, ?expiration, "grant issued");
        Ok(Grant { token, expiration })
    }

    /// Re-insert a resource under a known token, e.g. after a restart.
    pub fn restore(&self, token: GrantToken, resource: R, expiration: Expiration) {
        self.insert(token, resource, expiration);
    }

    fn insert(&self, token: GrantToken, resource: R, expiration: Expiration) {
        let issued = self.issued.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            token,
            GrantEntry {
                resource,
                expiration,
                issued,
            },
        );
    }

    /// Renew a grant. The new expiration is computed from now, not added to
    /// the old one.
    ///
    /// # Errors
    /// `UnknownGrant` if the token is absent or already expired; policy
    /// errors otherwise.
    pub fn renew(&self, token: GrantToken, requested: GrantDuration) -> Result<Expiration, GrantError> {
        let now = self.clock.now();
        let expiration = self.policy.expiration(now, requested)?;

        let lapsed = match self.entries.get_mut(&token) {
            None => return Err(GrantError::UnknownGrant { token }),
            Some(mut entry) => {
                if entry.expiration.is_live(now) {
                    entry.expiration = expiration;
                    false
                } else {
                    true
                }
            }
        };

        if lapsed {
            self.remove_if_expired(token);
            return Err(GrantError::UnknownGrant { token });
        }

        debug!(token = %token, ?expiration, "grant renewed");
        Ok(expiration)
    }

    /// Cancel a grant. Returns false if the token was already gone.
    pub fn cancel(&self, token: GrantToken) -> bool {
        self.remove(token, RemovalReason::Cancelled).is_some()
    }

    /// Evict a resource after a delivery failure.
    pub fn revoke(&self, token: GrantToken) -> bool {
        self.remove(token, RemovalReason::Revoked).is_some()
    }

    /// Remove a resource and notify the owner.
    pub fn remove(&self, token: GrantToken, reason: RemovalReason) -> Option<Expiration> {
        let (_, entry) = self.entries.remove(&token)?;
        self.notify_removed(token, &entry.resource, reason);
        Some(entry.expiration)
    }

    fn remove_if_expired(&self, token: GrantToken) -> bool {
        let now = self.clock.now();
        match self.entries.remove_if(&token, |_, e| !e.expiration.is_live(now)) {
            Some((_, entry)) => {
                debug!(token = %token, "grant expired");
                self.notify_removed(token, &entry.resource, RemovalReason::Expired);
                true
            }
            None => false,
        }
    }

    fn notify_removed(&self, token: GrantToken, resource: &R, reason: RemovalReason) {
        if let Some(hook) = self.on_removed.read().as_ref() {
            hook(token, resource, reason);
        }
    }

    /// `expiration > now`.
    #[must_use]
    pub fn is_valid(&self, token: GrantToken) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&token)
            .is_some_and(|e| e.expiration.is_live(now))
    }

    /// Current expiration of a live grant.
    #[must_use]
    pub fn expiration(&self, token: GrantToken) -> Option<Expiration> {
        let now = self.clock.now();
        self.entries
            .get(&token)
            .map(|e| e.expiration)
            .filter(|e| e.is_live(now))
    }

    /// Evict every expired entry. Returns the evicted tokens.
    pub fn reap_expired(&self) -> Vec<GrantToken> {
        let now = self.clock.now();
        let candidates: Vec<GrantToken> = self
            .entries
            .iter()
            .filter(|e| !e.expiration.is_live(now))
            .map(|e| *e.key())
            .collect();

        candidates
            .into_iter()
            .filter(|token| self.remove_if_expired(*token))
            .collect()
    }

    /// Number of physically present entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R: Clone> GrantRegistry<R> {
    /// Resource behind a live grant.
    #[must_use]
    pub fn get(&self, token: GrantToken) -> Option<R> {
        let now = self.clock.now();
        self.entries
            .get(&token)
            .filter(|e| e.expiration.is_live(now))
            .map(|e| e.resource.clone())
    }

    /// All entries in issue order, including expired ones the caller has not
    /// yet evicted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(GrantToken, R)> {
        let mut out: Vec<(u64, GrantToken, R)> = self
            .entries
            .iter()
            .map(|e| (e.issued, *e.key(), e.resource.clone()))
            .collect();
        out.sort_unstable_by_key(|(issued, _, _)| *issued);
        out.into_iter().map(|(_, token, r)| (token, r)).collect()
    }
}
