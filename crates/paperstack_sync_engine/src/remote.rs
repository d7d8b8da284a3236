//! Remote adapter abstraction.
//!
//! The engine never speaks a wire protocol; it consumes this trait.
//! Implementations (GraphQL, REST, object storage) must report a version
//! mismatch as [`crate::SyncError::VersionConflict`], never as a generic
//! failure.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use paperstack_core::{Document, SyncId, SyncState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// A single remote-originated change.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Affected document identifier.
    pub sync_id: SyncId,
    /// The document snapshot, absent for deletions.
    pub document: Option<Document>,
    /// True when the document was deleted remotely.
    pub deleted: bool,
    /// Watermark of this change.
    pub watermark: u64,
}

/// A page of remote changes newer than a watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    /// The changes, oldest first.
    pub changes: Vec<RemoteChange>,
    /// Watermark to resume from.
    pub new_watermark: u64,
    /// True when more changes are available.
    pub has_more: bool,
}

/// Abstraction over the remote backend, keyed by identifier and version.
pub trait RemoteAdapter: Send + Sync {
    /// Creates a document remotely; returns the accepted version.
    fn create(&self, document: &Document) -> SyncResult<i64>;

    /// Updates a document, conditioned on `expected_version` matching the
    /// remote's current version; returns the accepted version.
    fn update(&self, document: &Document, expected_version: i64) -> SyncResult<i64>;

    /// Deletes a document remotely. Deleting an absent document is not an
    /// error.
    fn delete(&self, sync_id: &SyncId) -> SyncResult<()>;

    /// Fetches the current remote snapshot, if any.
    fn fetch(&self, sync_id: &SyncId) -> SyncResult<Option<Document>>;

    /// Lists changes strictly newer than `watermark`, up to `limit`.
    fn list_changed_since(&self, watermark: u64, limit: u32) -> SyncResult<ChangePage>;

    /// Subscribes to future remote changes, optionally restricted to the
    /// given identifiers.
    fn subscribe(&self, filter: Option<Vec<SyncId>>) -> Receiver<RemoteChange>;
}

/// An in-memory remote for tests and examples.
///
/// Tracks per-document versions, keeps a change log for cursor paging,
/// fans changes out to subscribers, and can inject transient failures.
pub struct MemoryRemoteAdapter {
    documents: RwLock<HashMap<SyncId, Document>>,
    log: RwLock<Vec<RemoteChange>>,
    next_watermark: AtomicU64,
    fail_remaining: AtomicU32,
    subscribers: RwLock<Vec<Subscriber>>,
}

struct Subscriber {
    sender: Sender<RemoteChange>,
    filter: Option<HashSet<SyncId>>,
}

impl Subscriber {
    fn wants(&self, sync_id: &SyncId) -> bool {
        self.filter.as_ref().map_or(true, |ids| ids.contains(sync_id))
    }
}

impl MemoryRemoteAdapter {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
            next_watermark: AtomicU64::new(1),
            fail_remaining: AtomicU32::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Makes the next `count` calls fail with a transient network error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns the current remote snapshot, if any.
    pub fn document(&self, sync_id: &SyncId) -> Option<Document> {
        self.documents.read().get(sync_id).cloned()
    }

    /// Returns the number of stored documents.
    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Simulates a server-side edit: stores the document verbatim and
    /// records a change.
    pub fn push_remote_change(&self, document: Document) {
        let mut normalized = document;
        normalized.sync_state = SyncState::Synced;
        normalized.conflict_id = None;
        self.documents
            .write()
            .insert(normalized.sync_id.clone(), normalized.clone());
        self.record_change(normalized.sync_id.clone(), Some(normalized), false);
    }

    /// Simulates a server-side deletion.
    pub fn push_remote_delete(&self, sync_id: &SyncId) {
        self.documents.write().remove(sync_id);
        self.record_change(sync_id.clone(), None, true);
    }

    fn record_change(&self, sync_id: SyncId, document: Option<Document>, deleted: bool) {
        let watermark = self.next_watermark.fetch_add(1, Ordering::SeqCst);
        let change = RemoteChange {
            sync_id,
            document,
            deleted,
            watermark,
        };
        self.log.write().push(change.clone());
        self.subscribers.write().retain(|sub| {
            if !sub.wants(&change.sync_id) {
                return true;
            }
            sub.sender.send(change.clone()).is_ok()
        });
    }

    fn check_failure(&self) -> SyncResult<()> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transient("injected failure"));
        }
        Ok(())
    }
}

impl Default for MemoryRemoteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteAdapter for MemoryRemoteAdapter {
    fn create(&self, document: &Document) -> SyncResult<i64> {
        self.check_failure()?;
        let mut documents = self.documents.write();
        if let Some(existing) = documents.get(&document.sync_id) {
            return Err(SyncError::VersionConflict {
                sync_id: document.sync_id.clone(),
                local_version: document.version,
                remote_version: existing.version,
            });
        }
        let mut stored = document.clone();
        stored.sync_state = SyncState::Synced;
        stored.conflict_id = None;
        documents.insert(document.sync_id.clone(), stored.clone());
        drop(documents);
        self.record_change(stored.sync_id.clone(), Some(stored.clone()), false);
        Ok(stored.version)
    }

    fn update(&self, document: &Document, expected_version: i64) -> SyncResult<i64> {
        self.check_failure()?;
        let mut documents = self.documents.write();
        let Some(existing) = documents.get(&document.sync_id) else {
            return Err(SyncError::remote_rejected(format!(
                "unknown document {}",
                document.sync_id
            )));
        };
        if existing.version != expected_version {
            return Err(SyncError::VersionConflict {
                sync_id: document.sync_id.clone(),
                local_version: document.version,
                remote_version: existing.version,
            });
        }
        let mut stored = document.clone();
        stored.sync_state = SyncState::Synced;
        stored.conflict_id = None;
        documents.insert(document.sync_id.clone(), stored.clone());
        drop(documents);
        self.record_change(stored.sync_id.clone(), Some(stored.clone()), false);
        Ok(stored.version)
    }

    fn delete(&self, sync_id: &SyncId) -> SyncResult<()> {
        self.check_failure()?;
        let removed = self.documents.write().remove(sync_id).is_some();
        if removed {
            self.record_change(sync_id.clone(), None, true);
        }
        Ok(())
    }

    fn fetch(&self, sync_id: &SyncId) -> SyncResult<Option<Document>> {
        self.check_failure()?;
        Ok(self.documents.read().get(sync_id).cloned())
    }

    fn list_changed_since(&self, watermark: u64, limit: u32) -> SyncResult<ChangePage> {
        self.check_failure()?;
        let log = self.log.read();
        let newer: Vec<RemoteChange> = log
            .iter()
            .filter(|c| c.watermark > watermark)
            .take(limit as usize)
            .cloned()
            .collect();
        let new_watermark = newer.last().map(|c| c.watermark).unwrap_or(watermark);
        let has_more = log.iter().any(|c| c.watermark > new_watermark);
        Ok(ChangePage {
            changes: newer,
            new_watermark,
            has_more,
        })
    }

    fn subscribe(&self, filter: Option<Vec<SyncId>>) -> Receiver<RemoteChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(Subscriber {
            sender: tx,
            filter: filter.map(|ids| ids.into_iter().collect()),
        });
        rx
    }
}
