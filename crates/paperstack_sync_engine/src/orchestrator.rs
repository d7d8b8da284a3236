//! Sync orchestration.
//!
//! `run_cycle` drives the end-to-end reconciliation: entitlement check,
//! queue consolidation, bounded-parallel uploads with per-identifier
//! serialization, conflict routing, and the watermark-driven download
//! path. A cycle already in progress makes a second invocation no-op
//! instead of interleaving; cancellation is honored between operation
//! boundaries, never mid-write.

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Resolution, ResolutionStrategy};
use crate::entitlement::{Denial, EntitlementGate, EntitlementProvider};
use crate::error::{SyncError, SyncResult};
use crate::queue::{DocumentPatch, OperationKind, QueuedOperation, SyncQueue};
use crate::remote::{RemoteAdapter, RemoteChange};
use parking_lot::{Mutex, MutexGuard, RwLock};
use paperstack_core::{
    ChangeFeed, Document, DocumentEventKind, LocalStore, SyncId, SyncState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cumulative statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran (completed, local-only, or cancelled).
    pub cycles_completed: u64,
    /// Documents uploaded in total.
    pub documents_uploaded: u64,
    /// Remote changes applied locally in total.
    pub documents_downloaded: u64,
    /// Operations that failed after retries.
    pub operations_failed: u64,
    /// Conflicts detected and suspended.
    pub conflicts_detected: u64,
    /// Last error message, if any.
    pub last_error: Option<String>,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Upload and download phases ran to the end.
    Completed,
    /// The entitlement gate denied cloud operations; nothing ran.
    LocalOnly,
    /// Another cycle was in flight; this invocation did nothing.
    AlreadyRunning,
    /// The cycle stopped at a safe boundary after a cancel request.
    Cancelled,
}

/// Summary of a single cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Operations applied to the remote.
    pub uploaded: u64,
    /// Remote changes applied locally.
    pub downloaded: u64,
    /// Operations that failed after retries.
    pub failed: u64,
    /// Conflicts detected and suspended.
    pub conflicts: u64,
    /// The gate denial, when the outcome is local-only.
    pub denial: Option<Denial>,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

impl Default for CycleSummary {
    fn default() -> Self {
        Self {
            outcome: CycleOutcome::Completed,
            uploaded: 0,
            downloaded: 0,
            failed: 0,
            conflicts: 0,
            denial: None,
            duration: Duration::ZERO,
        }
    }
}

impl CycleSummary {
    fn already_running() -> Self {
        Self {
            outcome: CycleOutcome::AlreadyRunning,
            ..Self::default()
        }
    }
}

enum OperationOutcome {
    Sent,
    Conflict,
    Failed,
    Skipped,
}

enum DownloadOutcome {
    Applied,
    Conflict,
    Skipped,
}

/// Drives reconciliation between the local store and a remote adapter.
pub struct SyncOrchestrator<R: RemoteAdapter, P: EntitlementProvider> {
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    gate: Arc<EntitlementGate<P>>,
    remote: Arc<R>,
    feed: Arc<ChangeFeed>,
    config: SyncConfig,
    stats: RwLock<SyncStats>,
    cycle_guard: Mutex<()>,
    cancelled: AtomicBool,
    id_locks: Mutex<HashMap<SyncId, Arc<Mutex<()>>>>,
}

impl<R: RemoteAdapter, P: EntitlementProvider> SyncOrchestrator<R, P> {
    /// Creates an orchestrator over explicitly constructed collaborators.
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<SyncQueue>,
        gate: Arc<EntitlementGate<P>>,
        remote: Arc<R>,
        feed: Arc<ChangeFeed>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            gate,
            remote,
            feed,
            config,
            stats: RwLock::new(SyncStats::default()),
            cycle_guard: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the local store handle.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Returns the pending operation queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Returns the entitlement gate.
    pub fn gate(&self) -> &Arc<EntitlementGate<P>> {
        &self.gate
    }

    /// Returns the document change feed.
    pub fn change_feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Requests cooperative cancellation of an in-flight cycle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Blocks until no cycle is in flight, holding the cycle mutex.
    pub(crate) fn lock_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle_guard.lock()
    }

    // ---- local mutation API ----

    /// Records a locally created document and queues its upload.
    pub fn create_document(&self, document: Document) -> SyncResult<()> {
        let lock = self.identifier_lock(&document.sync_id);
        let _guard = lock.lock();
        self.store.insert_document(&document)?;
        self.queue.enqueue(QueuedOperation::upload(&document))?;
        self.feed
            .emit(document.sync_id.clone(), DocumentEventKind::Created);
        Ok(())
    }

    /// Applies a local edit and queues its propagation.
    ///
    /// An edit to a synced document re-arms the state machine and bumps
    /// the version once — this content is a new syncable revision. Edits
    /// while already pending fold into the same revision.
    pub fn edit_document(&self, sync_id: &SyncId, patch: DocumentPatch) -> SyncResult<Document> {
        let lock = self.identifier_lock(sync_id);
        let _guard = lock.lock();
        let mut document = self.store.get_document(sync_id)?;
        patch.apply_to(&mut document);
        if document.sync_state == SyncState::Synced {
            document.transition(SyncState::PendingUpload)?;
            document.bump_version();
        }
        self.store.update_document(&mut document)?;
        self.queue
            .enqueue(QueuedOperation::update(sync_id.clone(), patch))?;
        self.feed.emit(sync_id.clone(), DocumentEventKind::Updated);
        Ok(document)
    }

    /// Deletes a document locally and queues the remote delete.
    pub fn delete_document(&self, sync_id: &SyncId) -> SyncResult<()> {
        let lock = self.identifier_lock(sync_id);
        let _guard = lock.lock();
        self.store.delete_document(sync_id)?;
        self.queue.enqueue(QueuedOperation::delete(sync_id.clone()))?;
        self.feed.emit(sync_id.clone(), DocumentEventKind::Deleted);
        Ok(())
    }

    /// Re-arms errored documents (excluding suspended conflicts) for the
    /// next cycle. Returns how many were re-armed.
    pub fn retry_failed(&self) -> SyncResult<u64> {
        let mut rearmed = 0;
        for document in self.store.documents_by_state(SyncState::Error)? {
            if document.conflict_id.is_some() {
                continue;
            }
            let lock = self.identifier_lock(&document.sync_id);
            let _guard = lock.lock();
            self.store
                .set_sync_state(&document.sync_id, SyncState::PendingUpload)?;
            let queued = self
                .queue
                .operations()
                .iter()
                .any(|op| op.sync_id == document.sync_id);
            if !queued {
                // Version 1 means the initial revision never reached the
                // remote: retry as a creation, not a revision.
                let operation = if document.version <= 1 {
                    QueuedOperation::upload(&document)
                } else {
                    QueuedOperation::update(
                        document.sync_id.clone(),
                        DocumentPatch::from_document(&document),
                    )
                };
                self.queue.enqueue(operation)?;
            }
            self.feed
                .emit(document.sync_id.clone(), DocumentEventKind::StateChanged);
            rearmed += 1;
        }
        Ok(rearmed)
    }

    // ---- cycle ----

    /// Runs one sync cycle and returns its summary.
    pub fn run_cycle(&self) -> CycleSummary {
        let started = Instant::now();
        let Some(_cycle) = self.cycle_guard.try_lock() else {
            tracing::debug!("sync cycle already in progress");
            return CycleSummary::already_running();
        };
        self.cancelled.store(false, Ordering::SeqCst);

        let mut summary = CycleSummary::default();
        if !self.gate.can_perform_cloud_sync() {
            summary.outcome = CycleOutcome::LocalOnly;
            summary.denial = self.gate.denial();
            summary.duration = started.elapsed();
            tracing::info!(
                reason = %self.gate.denial_reason(),
                "cloud sync denied, staying local-only"
            );
            self.record_summary(&summary);
            return summary;
        }

        if let Err(e) = self.queue.consolidate() {
            summary.failed += 1;
            self.note_error(&e);
        }
        let operations = self.queue.operations();
        let uploaded = self.push_operations(&operations, &mut summary);

        if summary.outcome != CycleOutcome::Cancelled {
            self.pull_changes(&uploaded, &mut summary);
        }

        summary.duration = started.elapsed();
        self.record_summary(&summary);
        tracing::info!(
            uploaded = summary.uploaded,
            downloaded = summary.downloaded,
            failed = summary.failed,
            conflicts = summary.conflicts,
            "sync cycle finished"
        );
        summary
    }

    /// Applies a resolution strategy to a suspended conflict.
    pub fn resolve_conflict(
        &self,
        sync_id: &SyncId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<()> {
        let lock = self.identifier_lock(sync_id);
        let _guard = lock.lock();
        let local = self.store.get_document(sync_id)?;
        let snapshot_id = local.conflict_id.ok_or_else(|| {
            SyncError::validation(format!("no conflict suspended for {sync_id}"))
        })?;
        let remote = self
            .store
            .conflict_snapshot(snapshot_id)?
            .ok_or_else(|| SyncError::validation("conflict snapshot missing"))?;

        match ConflictResolver::resolve(&local, &remote, strategy)? {
            Resolution::Single { mut document, resubmit } => {
                self.store.clear_conflict(sync_id)?;
                self.queue.remove(sync_id)?;
                if resubmit {
                    self.store.update_document(&mut document)?;
                    self.queue.enqueue(QueuedOperation::update(
                        sync_id.clone(),
                        DocumentPatch::from_document(&document),
                    ))?;
                } else {
                    self.store.upsert_document(&document)?;
                }
                self.feed.emit(sync_id.clone(), DocumentEventKind::StateChanged);
            }
            Resolution::Both {
                retained,
                reassigned,
            } => {
                self.store.clear_conflict(sync_id)?;
                self.queue.remove(sync_id)?;
                self.store.upsert_document(&retained)?;
                self.store.insert_document(&reassigned)?;
                self.queue.enqueue(QueuedOperation::upload(&reassigned))?;
                self.feed.emit(sync_id.clone(), DocumentEventKind::StateChanged);
                self.feed
                    .emit(reassigned.sync_id.clone(), DocumentEventKind::Created);
            }
        }
        tracing::info!(sync_id = %sync_id, ?strategy, "conflict resolved");
        Ok(())
    }

    // ---- upload path ----

    fn push_operations(
        &self,
        operations: &[QueuedOperation],
        summary: &mut CycleSummary,
    ) -> HashSet<SyncId> {
        let mut uploaded = HashSet::new();
        for chunk in operations.chunks(self.config.max_parallel_remote_calls) {
            // Cancellation is honored between operation boundaries.
            if self.cancelled.load(Ordering::SeqCst) {
                summary.outcome = CycleOutcome::Cancelled;
                tracing::info!("cycle cancelled before next operation batch");
                break;
            }
            let outcomes: Vec<(SyncId, OperationOutcome)> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|op| (op.sync_id.clone(), scope.spawn(move || self.apply_operation(op))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(sync_id, handle)| {
                        let outcome = handle
                            .join()
                            .unwrap_or(OperationOutcome::Failed);
                        (sync_id, outcome)
                    })
                    .collect()
            });
            for (sync_id, outcome) in outcomes {
                match outcome {
                    OperationOutcome::Sent => {
                        summary.uploaded += 1;
                        uploaded.insert(sync_id);
                    }
                    OperationOutcome::Conflict => summary.conflicts += 1,
                    OperationOutcome::Failed => summary.failed += 1,
                    OperationOutcome::Skipped => {}
                }
            }
        }
        uploaded
    }

    fn apply_operation(&self, op: &QueuedOperation) -> OperationOutcome {
        // Operations on the same identifier are strictly serialized.
        let lock = self.identifier_lock(&op.sync_id);
        let _guard = lock.lock();
        let result = match op.kind {
            OperationKind::Delete => self.apply_delete(op),
            _ => self.apply_write(op),
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.note_error(&e);
                OperationOutcome::Failed
            }
        }
    }

    fn apply_write(&self, op: &QueuedOperation) -> SyncResult<OperationOutcome> {
        let Some(document) = self.store.try_get_document(&op.sync_id)? else {
            // Deleted locally since it was queued; nothing left to send.
            self.queue.remove(&op.sync_id)?;
            return Ok(OperationOutcome::Skipped);
        };
        if document.conflict_id.is_some() {
            tracing::debug!(sync_id = %op.sync_id, "identifier suspended, skipping");
            return Ok(OperationOutcome::Skipped);
        }
        if document.sync_state == SyncState::Error {
            // Errored documents re-arm only through an explicit retry.
            return Ok(OperationOutcome::Skipped);
        }
        if document.sync_state != SyncState::PendingUpload {
            self.queue.remove(&op.sync_id)?;
            return Ok(OperationOutcome::Skipped);
        }

        self.store.set_sync_state(&op.sync_id, SyncState::Uploading)?;
        let sent = self.with_retry(|| match op.kind {
            OperationKind::Upload => self.remote.create(&document),
            _ => self.remote.update(&document, document.version - 1),
        });
        match sent {
            Ok(accepted_version) => {
                self.store.set_sync_state(&op.sync_id, SyncState::Synced)?;
                self.queue.remove(&op.sync_id)?;
                self.feed
                    .emit(op.sync_id.clone(), DocumentEventKind::StateChanged);
                tracing::debug!(sync_id = %op.sync_id, accepted_version, "upload accepted");
                Ok(OperationOutcome::Sent)
            }
            Err(SyncError::VersionConflict { remote_version, .. }) => {
                if let Err(e) = self.suspend_conflict(&op.sync_id, remote_version) {
                    let _ = self.store.set_sync_state(&op.sync_id, SyncState::Error);
                    return Err(e);
                }
                Ok(OperationOutcome::Conflict)
            }
            Err(e) => {
                self.store.set_sync_state(&op.sync_id, SyncState::Error)?;
                self.feed
                    .emit(op.sync_id.clone(), DocumentEventKind::StateChanged);
                tracing::warn!(sync_id = %op.sync_id, error = %e, "upload failed");
                self.note_error(&e);
                Ok(OperationOutcome::Failed)
            }
        }
    }

    fn apply_delete(&self, op: &QueuedOperation) -> SyncResult<OperationOutcome> {
        self.with_retry(|| self.remote.delete(&op.sync_id))?;
        self.queue.remove(&op.sync_id)?;
        self.feed.emit(op.sync_id.clone(), DocumentEventKind::Deleted);
        tracing::debug!(sync_id = %op.sync_id, "remote delete accepted");
        Ok(OperationOutcome::Sent)
    }

    /// Stores the conflicting remote snapshot and suspends the identifier.
    fn suspend_conflict(&self, sync_id: &SyncId, remote_version: i64) -> SyncResult<()> {
        match self.remote.fetch(sync_id)? {
            Some(remote_doc) => {
                self.store.mark_conflict(sync_id, &remote_doc)?;
            }
            None => {
                // The remote row vanished between rejection and fetch;
                // leave the document errored for a manual retry.
                self.store.set_sync_state(sync_id, SyncState::Error)?;
            }
        }
        tracing::warn!(sync_id = %sync_id, remote_version, "version conflict suspended");
        self.feed
            .emit(sync_id.clone(), DocumentEventKind::ConflictDetected);
        Ok(())
    }

    // ---- download path ----

    fn pull_changes(&self, uploaded: &HashSet<SyncId>, summary: &mut CycleSummary) {
        let mut watermark = match self.store.watermark() {
            Ok(w) => w,
            Err(e) => {
                summary.failed += 1;
                self.note_error(&e.into());
                return;
            }
        };
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                summary.outcome = CycleOutcome::Cancelled;
                tracing::info!("cycle cancelled before next download page");
                break;
            }
            let page = match self.with_retry(|| {
                self.remote
                    .list_changed_since(watermark, self.config.pull_batch_size)
            }) {
                Ok(page) => page,
                Err(e) => {
                    summary.failed += 1;
                    self.note_error(&e);
                    break;
                }
            };
            for change in &page.changes {
                // Never re-download a write made in this same cycle.
                if uploaded.contains(&change.sync_id) {
                    continue;
                }
                match self.apply_remote_change(change) {
                    Ok(DownloadOutcome::Applied) => summary.downloaded += 1,
                    Ok(DownloadOutcome::Conflict) => summary.conflicts += 1,
                    Ok(DownloadOutcome::Skipped) => {}
                    Err(e) => {
                        summary.failed += 1;
                        self.note_error(&e);
                    }
                }
            }
            watermark = page.new_watermark;
            if let Err(e) = self.store.set_watermark(watermark) {
                summary.failed += 1;
                self.note_error(&e.into());
                break;
            }
            if !page.has_more {
                break;
            }
        }
    }

    fn apply_remote_change(&self, change: &RemoteChange) -> SyncResult<DownloadOutcome> {
        let lock = self.identifier_lock(&change.sync_id);
        let _guard = lock.lock();

        if change.deleted {
            return match self.store.try_get_document(&change.sync_id)? {
                None => Ok(DownloadOutcome::Skipped),
                Some(local) if local.sync_state.is_locally_dirty() => {
                    // Local edits outlive a remote tombstone until pushed.
                    Ok(DownloadOutcome::Skipped)
                }
                Some(_) => {
                    self.store.delete_document(&change.sync_id)?;
                    self.feed
                        .emit(change.sync_id.clone(), DocumentEventKind::Deleted);
                    Ok(DownloadOutcome::Applied)
                }
            };
        }

        let Some(remote_doc) = &change.document else {
            return Ok(DownloadOutcome::Skipped);
        };
        match self.store.try_get_document(&change.sync_id)? {
            None => {
                // Brand-new remote document: arrives through the
                // download states rather than appearing synced out of
                // nowhere.
                let mut incoming = remote_doc.clone();
                incoming.sync_state = SyncState::PendingDownload;
                incoming.conflict_id = None;
                self.store.insert_document(&incoming)?;
                self.store
                    .set_sync_state(&change.sync_id, SyncState::Downloading)?;
                self.store
                    .set_sync_state(&change.sync_id, SyncState::Synced)?;
                self.feed
                    .emit(change.sync_id.clone(), DocumentEventKind::Downloaded);
                Ok(DownloadOutcome::Applied)
            }
            Some(local) => {
                if local.conflict_id.is_some() {
                    return Ok(DownloadOutcome::Skipped);
                }
                if ConflictResolver::conflicts_with(&local, remote_doc) {
                    self.store.mark_conflict(&change.sync_id, remote_doc)?;
                    self.feed
                        .emit(change.sync_id.clone(), DocumentEventKind::ConflictDetected);
                    return Ok(DownloadOutcome::Conflict);
                }
                if remote_doc.version > local.version {
                    self.store
                        .set_sync_state(&change.sync_id, SyncState::PendingDownload)?;
                    self.store
                        .set_sync_state(&change.sync_id, SyncState::Downloading)?;
                    let mut incoming = remote_doc.clone();
                    incoming.sync_state = SyncState::Downloading;
                    incoming.conflict_id = None;
                    self.store.upsert_document(&incoming)?;
                    self.store
                        .set_sync_state(&change.sync_id, SyncState::Synced)?;
                    self.feed
                        .emit(change.sync_id.clone(), DocumentEventKind::Downloaded);
                    Ok(DownloadOutcome::Applied)
                } else {
                    // Same revision already present.
                    Ok(DownloadOutcome::Skipped)
                }
            }
        }
    }

    // ---- shared plumbing ----

    fn with_retry<T>(&self, mut call: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    tracing::warn!(attempt, error = %e, "transient remote failure, backing off");
                    std::thread::sleep(retry.delay_for_retry(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn identifier_lock(&self, sync_id: &SyncId) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock();
        Arc::clone(
            locks
                .entry(sync_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn note_error(&self, error: &SyncError) {
        self.stats.write().last_error = Some(error.to_string());
    }

    fn record_summary(&self, summary: &CycleSummary) {
        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.documents_uploaded += summary.uploaded;
        stats.documents_downloaded += summary.downloaded;
        stats.operations_failed += summary.failed;
        stats.conflicts_detected += summary.conflicts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::entitlement::{EntitlementSnapshot, MockEntitlementProvider};
    use crate::remote::MemoryRemoteAdapter;
    use paperstack_core::Document;

    type TestOrchestrator = SyncOrchestrator<MemoryRemoteAdapter, MockEntitlementProvider>;

    fn orchestrator_with(provider: MockEntitlementProvider) -> TestOrchestrator {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let queue = Arc::new(SyncQueue::with_store(Arc::clone(&store)).unwrap());
        let gate = Arc::new(EntitlementGate::new(
            Arc::new(provider),
            crate::config::EntitlementConfig::new().with_retry(RetryConfig::no_retry()),
        ));
        let remote = Arc::new(MemoryRemoteAdapter::new());
        let feed = Arc::new(ChangeFeed::new());
        let config = SyncConfig::new().with_retry(
            RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)),
        );
        SyncOrchestrator::new(store, queue, gate, remote, feed, config)
    }

    fn entitled_orchestrator() -> TestOrchestrator {
        orchestrator_with(MockEntitlementProvider::with_snapshot(
            EntitlementSnapshot::active("pro"),
        ))
    }

    #[test]
    fn denied_gate_short_circuits_to_local_only() {
        let orchestrator = orchestrator_with(MockEntitlementProvider::with_snapshot(
            EntitlementSnapshot::not_entitled(),
        ));
        orchestrator
            .create_document(Document::builder("Rent").build())
            .unwrap();

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.outcome, CycleOutcome::LocalOnly);
        assert!(summary.denial.is_some());
        assert_eq!(summary.uploaded, 0);
        // The local mutation survived regardless of the denial.
        assert_eq!(orchestrator.store().list_documents().unwrap().len(), 1);
        assert_eq!(orchestrator.queue().len(), 1);
    }

    #[test]
    fn concurrent_invocation_no_ops() {
        let orchestrator = entitled_orchestrator();
        let _in_flight = orchestrator.lock_cycle();
        let summary = orchestrator.run_cycle();
        assert_eq!(summary.outcome, CycleOutcome::AlreadyRunning);
        assert_eq!(orchestrator.stats().cycles_completed, 0);
    }

    #[test]
    fn upload_transitions_to_synced_and_clears_queue() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        orchestrator.create_document(document).unwrap();

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.outcome, CycleOutcome::Completed);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 0);

        let stored = orchestrator.store().get_document(&sync_id).unwrap();
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert!(orchestrator.queue().is_empty());
    }

    #[test]
    fn transient_failures_are_retried_to_success() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        orchestrator.create_document(document).unwrap();
        orchestrator.remote.inject_transient_failures(2);

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(
            orchestrator.store().get_document(&sync_id).unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[test]
    fn exhausted_retries_leave_the_document_errored() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        orchestrator.create_document(document).unwrap();
        // Exactly the retry budget: 1 initial attempt + 3 retries.
        orchestrator.remote.inject_transient_failures(4);

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.failed, 1);
        assert_eq!(
            orchestrator.store().get_document(&sync_id).unwrap().sync_state,
            SyncState::Error
        );
        // The queue entry survives for a later retry.
        assert_eq!(orchestrator.queue().len(), 1);
    }

    #[test]
    fn retry_failed_rearms_errored_documents() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        orchestrator.create_document(document).unwrap();
        orchestrator.remote.inject_transient_failures(4);
        orchestrator.run_cycle();

        assert_eq!(orchestrator.retry_failed().unwrap(), 1);
        assert_eq!(
            orchestrator.store().get_document(&sync_id).unwrap().sync_state,
            SyncState::PendingUpload
        );

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(
            orchestrator.store().get_document(&sync_id).unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[test]
    fn own_writes_are_not_redownloaded_in_the_same_cycle() {
        let orchestrator = entitled_orchestrator();
        orchestrator
            .create_document(Document::builder("Rent").build())
            .unwrap();

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.downloaded, 0);
    }

    #[test]
    fn remote_documents_are_downloaded() {
        let orchestrator = entitled_orchestrator();
        let mut remote_doc = Document::builder("Shared notes").build();
        remote_doc.sync_state = SyncState::Synced;
        orchestrator.remote.push_remote_change(remote_doc.clone());

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.downloaded, 1);

        let stored = orchestrator
            .store()
            .get_document(&remote_doc.sync_id)
            .unwrap();
        assert_eq!(stored.title, "Shared notes");
        assert_eq!(stored.sync_state, SyncState::Synced);
        // The watermark advanced; a second cycle downloads nothing.
        let summary = orchestrator.run_cycle();
        assert_eq!(summary.downloaded, 0);
    }

    #[test]
    fn version_conflict_suspends_the_identifier() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();

        // The remote already has this identifier at another revision.
        let mut remote_copy = document.clone();
        remote_copy.title = "Rent (remote)".into();
        remote_copy.version = 4;
        orchestrator.remote.push_remote_change(remote_copy);

        orchestrator.create_document(document).unwrap();
        let summary = orchestrator.run_cycle();
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.uploaded, 0);

        let suspended = orchestrator.store().get_document(&sync_id).unwrap();
        assert_eq!(suspended.sync_state, SyncState::Error);
        assert!(suspended.conflict_id.is_some());

        // Suspended identifiers are skipped, not retried.
        let summary = orchestrator.run_cycle();
        assert_eq!(summary.conflicts, 0);
        assert_eq!(summary.uploaded, 0);
    }

    #[test]
    fn keep_local_resolution_resubmits_and_wins() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        let mut remote_copy = document.clone();
        remote_copy.title = "Rent (remote)".into();
        remote_copy.version = 4;
        orchestrator.remote.push_remote_change(remote_copy);
        orchestrator.create_document(document).unwrap();
        orchestrator.run_cycle();

        orchestrator
            .resolve_conflict(&sync_id, ResolutionStrategy::KeepLocal)
            .unwrap();
        let rearmed = orchestrator.store().get_document(&sync_id).unwrap();
        assert_eq!(rearmed.sync_state, SyncState::PendingUpload);
        assert_eq!(rearmed.version, 5);

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.uploaded, 1);
        let remote_now = orchestrator.remote.document(&sync_id).unwrap();
        assert_eq!(remote_now.title, "Rent");
        assert_eq!(remote_now.version, 5);
    }

    #[test]
    fn keep_remote_resolution_discards_pending_work() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        let mut remote_copy = document.clone();
        remote_copy.title = "Rent (remote)".into();
        remote_copy.version = 4;
        orchestrator.remote.push_remote_change(remote_copy);
        orchestrator.create_document(document).unwrap();
        orchestrator.run_cycle();

        orchestrator
            .resolve_conflict(&sync_id, ResolutionStrategy::KeepRemote)
            .unwrap();
        let resolved = orchestrator.store().get_document(&sync_id).unwrap();
        assert_eq!(resolved.title, "Rent (remote)");
        assert_eq!(resolved.sync_state, SyncState::Synced);
        assert!(orchestrator.queue().is_empty());
    }

    #[test]
    fn keep_both_resolution_forks_the_document() {
        let orchestrator = entitled_orchestrator();
        let document = Document::builder("Rent").build();
        let sync_id = document.sync_id.clone();
        let mut remote_copy = document.clone();
        remote_copy.title = "Rent (remote)".into();
        remote_copy.version = 4;
        orchestrator.remote.push_remote_change(remote_copy);
        orchestrator.create_document(document).unwrap();
        orchestrator.run_cycle();

        orchestrator
            .resolve_conflict(&sync_id, ResolutionStrategy::KeepBoth)
            .unwrap();
        let documents = orchestrator.store().list_documents().unwrap();
        assert_eq!(documents.len(), 2);

        let summary = orchestrator.run_cycle();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(orchestrator.remote.document_count(), 2);
    }

    #[test]
    fn cancel_targets_an_in_flight_cycle_only() {
        let orchestrator = entitled_orchestrator();
        orchestrator
            .create_document(Document::builder("Rent").build())
            .unwrap();
        // Cancellation is for stopping an in-flight cycle from another
        // thread; run_cycle resets the flag at its start, so a cancel
        // issued while idle does not poison the next cycle.
        orchestrator.cancel();
        let summary = orchestrator.run_cycle();
        assert_eq!(summary.outcome, CycleOutcome::Completed);
        assert_eq!(summary.uploaded, 1);
    }
}
