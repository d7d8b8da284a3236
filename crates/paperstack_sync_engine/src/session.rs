//! Active sync session and identity switching.
//!
//! A process has one active orchestrator at a time (one store, one
//! identity). Switching identities — sign-in, sign-out, guest to
//! authenticated — is serialized by a mutex and waits for the in-flight
//! cycle to reach a safe boundary before the swap, so no read or write is
//! admitted mid-switch and no two switches overlap.

use crate::entitlement::EntitlementProvider;
use crate::orchestrator::SyncOrchestrator;
use crate::remote::RemoteAdapter;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Holds the active orchestrator and serializes identity switches.
pub struct SyncSession<R: RemoteAdapter, P: EntitlementProvider> {
    active: RwLock<Arc<SyncOrchestrator<R, P>>>,
    switch_lock: Mutex<()>,
}

impl<R: RemoteAdapter, P: EntitlementProvider> SyncSession<R, P> {
    /// Creates a session with an initial identity.
    pub fn new(orchestrator: Arc<SyncOrchestrator<R, P>>) -> Self {
        Self {
            active: RwLock::new(orchestrator),
            switch_lock: Mutex::new(()),
        }
    }

    /// Returns the active orchestrator.
    pub fn orchestrator(&self) -> Arc<SyncOrchestrator<R, P>> {
        Arc::clone(&self.active.read())
    }

    /// Switches to another identity's orchestrator, returning the
    /// previous one.
    ///
    /// Cancels the in-flight cycle cooperatively, then blocks until it
    /// reaches a safe boundary before swapping.
    pub fn switch(&self, next: Arc<SyncOrchestrator<R, P>>) -> Arc<SyncOrchestrator<R, P>> {
        let _switch = self.switch_lock.lock();
        let current = self.orchestrator();
        current.cancel();
        // Wait for the running cycle, if any, to finish.
        let idle = current.lock_cycle();
        let previous = {
            let mut active = self.active.write();
            std::mem::replace(&mut *active, next)
        };
        drop(idle);
        tracing::info!("sync identity switched");
        previous
    }
}
