//! Entitlement gating for cloud operations.
//!
//! The gate caches the subscription status for a short TTL, retries the
//! external provider with backoff on a miss, degrades to a stale cached
//! value when the provider is unreachable, and fails safe to "no
//! entitlement" when it has nothing at all. A denied gate never blocks
//! local-only operations.

use crate::config::EntitlementConfig;
use crate::error::SyncResult;
use parking_lot::RwLock;
use paperstack_core::now_millis;
use std::sync::Arc;
use std::time::Instant;

/// Subscription status as reported by the entitlement provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementStatus {
    /// Entitled to cloud operations.
    Active,
    /// Entitlement existed but has lapsed.
    Expired,
    /// No entitlement.
    NotEntitled,
}

/// A provider response: status plus optional expiry and plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementSnapshot {
    /// Reported status.
    pub status: EntitlementStatus,
    /// Expiration instant, epoch milliseconds.
    pub expires_at: Option<i64>,
    /// Plan identifier, when entitled.
    pub plan_id: Option<String>,
}

impl EntitlementSnapshot {
    /// Creates an active snapshot.
    pub fn active(plan_id: impl Into<String>) -> Self {
        Self {
            status: EntitlementStatus::Active,
            expires_at: None,
            plan_id: Some(plan_id.into()),
        }
    }

    /// Creates a not-entitled snapshot.
    pub fn not_entitled() -> Self {
        Self {
            status: EntitlementStatus::NotEntitled,
            expires_at: None,
            plan_id: None,
        }
    }

    /// Sets the expiration instant.
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns the status with expiry applied: an `Active` snapshot whose
    /// expiration has passed reads as `Expired`.
    pub fn effective_status(&self, now_ms: i64) -> EntitlementStatus {
        match (self.status, self.expires_at) {
            (EntitlementStatus::Active, Some(expiry)) if expiry <= now_ms => {
                EntitlementStatus::Expired
            }
            (status, _) => status,
        }
    }
}

/// The external entitlement provider (app-store billing, licence server).
pub trait EntitlementProvider: Send + Sync {
    /// Queries the current entitlement status.
    fn query_status(&self) -> SyncResult<EntitlementSnapshot>;

    /// Restores previous purchases and returns the resulting status.
    fn restore(&self) -> SyncResult<EntitlementSnapshot>;
}

/// Why cloud operations are denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialCause {
    /// The user has no entitlement.
    NoEntitlement,
    /// The entitlement check could not be completed.
    CheckFailed,
    /// The entitlement has expired.
    Expired,
}

/// A denial surfaced to callers: an enum cause plus a readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Machine-readable cause.
    pub cause: DenialCause,
    /// Human-readable reason.
    pub reason: String,
}

impl Denial {
    fn new(cause: DenialCause, reason: impl Into<String>) -> Self {
        Self {
            cause,
            reason: reason.into(),
        }
    }
}

struct CachedStatus {
    snapshot: EntitlementSnapshot,
    checked_at: Instant,
}

/// Gate for cloud operations, backed by a cached entitlement check.
///
/// The cache lives for the process only; it is never persisted across
/// restarts.
pub struct EntitlementGate<P: EntitlementProvider> {
    provider: Arc<P>,
    config: EntitlementConfig,
    cache: RwLock<Option<CachedStatus>>,
    last_denial: RwLock<Option<Denial>>,
}

impl<P: EntitlementProvider> EntitlementGate<P> {
    /// Creates a gate over the given provider.
    pub fn new(provider: Arc<P>, config: EntitlementConfig) -> Self {
        Self {
            provider,
            config,
            cache: RwLock::new(None),
            last_denial: RwLock::new(None),
        }
    }

    /// Returns the entitlement status, from cache when fresh.
    ///
    /// Never fails: provider errors degrade to a stale cached value, or
    /// fail safe to [`EntitlementStatus::NotEntitled`] on a cold cache.
    pub fn get_status(&self) -> EntitlementStatus {
        self.status_at(Instant::now())
    }

    fn status_at(&self, now: Instant) -> EntitlementStatus {
        if let Some(cached) = self.cache.read().as_ref() {
            if now.duration_since(cached.checked_at) < self.config.ttl {
                let status = cached.snapshot.effective_status(now_millis());
                self.record_decision(status, DecisionSource::Cache);
                return status;
            }
        }
        self.query_provider(now)
    }

    fn query_provider(&self, now: Instant) -> EntitlementStatus {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            match self.provider.query_status() {
                Ok(snapshot) => {
                    let status = snapshot.effective_status(now_millis());
                    *self.cache.write() = Some(CachedStatus {
                        snapshot,
                        checked_at: now,
                    });
                    self.record_decision(status, DecisionSource::Fresh);
                    return status;
                }
                Err(e) if attempt < retry.max_retries => {
                    tracing::warn!(attempt, error = %e, "entitlement check failed, retrying");
                    std::thread::sleep(retry.delay_for_retry(attempt));
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "entitlement provider unreachable");
                    // Degrade to a stale value when one exists, even past
                    // its TTL; otherwise fail safe to a denial.
                    if let Some(cached) = self.cache.read().as_ref() {
                        let status = cached.snapshot.effective_status(now_millis());
                        self.record_decision(status, DecisionSource::Stale);
                        return status;
                    }
                    *self.last_denial.write() = Some(Denial::new(
                        DenialCause::CheckFailed,
                        format!("entitlement check failed: {e}"),
                    ));
                    return EntitlementStatus::NotEntitled;
                }
            }
        }
    }

    fn record_decision(&self, status: EntitlementStatus, source: DecisionSource) {
        let denial = match status {
            EntitlementStatus::Active => None,
            EntitlementStatus::Expired => Some(Denial::new(
                DenialCause::Expired,
                "subscription has expired",
            )),
            EntitlementStatus::NotEntitled => Some(Denial::new(
                DenialCause::NoEntitlement,
                "no active subscription",
            )),
        };
        if denial.is_some() {
            tracing::debug!(?status, ?source, "cloud sync denied");
        }
        *self.last_denial.write() = denial;
    }

    /// Returns true if cloud operations may proceed.
    pub fn can_perform_cloud_sync(&self) -> bool {
        self.get_status() == EntitlementStatus::Active
    }

    /// Returns the denial behind the most recent negative decision.
    pub fn denial(&self) -> Option<Denial> {
        self.last_denial.read().clone()
    }

    /// Returns a readable reason for the most recent denial.
    pub fn denial_reason(&self) -> String {
        self.last_denial
            .read()
            .as_ref()
            .map(|d| d.reason.clone())
            .unwrap_or_else(|| "cloud sync available".to_owned())
    }

    /// Always runs `local_fn`; additionally runs `cloud_fn` when the gate
    /// allows. A failed or errored gate check counts as a denial and is
    /// logged, never propagated — local work is unconditional.
    pub fn execute_with_gating<T, U>(
        &self,
        cloud_fn: impl FnOnce() -> T,
        local_fn: impl FnOnce() -> U,
    ) -> (U, Option<T>) {
        let local = local_fn();
        let cloud = if self.can_perform_cloud_sync() {
            Some(cloud_fn())
        } else {
            tracing::debug!(reason = %self.denial_reason(), "skipping cloud branch");
            None
        };
        (local, cloud)
    }

    /// Queries the provider unconditionally, bypassing the cache.
    pub fn refresh(&self) -> EntitlementStatus {
        self.query_provider(Instant::now())
    }

    /// Restores purchases through the provider and refreshes the cache.
    pub fn restore(&self) -> SyncResult<EntitlementStatus> {
        let snapshot = self.provider.restore()?;
        let status = snapshot.effective_status(now_millis());
        *self.cache.write() = Some(CachedStatus {
            snapshot,
            checked_at: Instant::now(),
        });
        self.record_decision(status, DecisionSource::Fresh);
        Ok(status)
    }

    /// Resets the gate to its cold-start state.
    pub fn clear_cache(&self) {
        *self.cache.write() = None;
        *self.last_denial.write() = None;
    }
}

#[derive(Debug)]
enum DecisionSource {
    Cache,
    Fresh,
    Stale,
}

/// A scriptable provider for tests and examples.
pub struct MockEntitlementProvider {
    snapshot: RwLock<SyncResult<EntitlementSnapshot>>,
    calls: std::sync::atomic::AtomicU32,
}

impl MockEntitlementProvider {
    /// Creates a provider that reports the given snapshot.
    pub fn with_snapshot(snapshot: EntitlementSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Ok(snapshot)),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Creates a provider that fails every query.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            snapshot: RwLock::new(Err(crate::error::SyncError::entitlement_check(message))),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Replaces the scripted response.
    pub fn set_response(&self, response: SyncResult<EntitlementSnapshot>) {
        *self.snapshot.write() = response;
    }

    /// Returns how many times the provider was queried.
    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn respond(&self) -> SyncResult<EntitlementSnapshot> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match &*self.snapshot.read() {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(e) => Err(crate::error::SyncError::entitlement_check(e.to_string())),
        }
    }
}

impl EntitlementProvider for MockEntitlementProvider {
    fn query_status(&self) -> SyncResult<EntitlementSnapshot> {
        self.respond()
    }

    fn restore(&self) -> SyncResult<EntitlementSnapshot> {
        self.respond()
    }
}
