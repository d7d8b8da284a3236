//! Pending operation queue and consolidation.
//!
//! The queue is an ordered multiset of operations keyed by sync
//! identifier. Consolidation reduces each identifier's group to at most
//! one operation carrying the same net effect, so a cycle never sends
//! more than one document-level operation per identifier.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use paperstack_core::{now_millis, Document, LocalStore, QueueRow, SyncId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create the document remotely.
    Upload,
    /// Revise the document remotely.
    Update,
    /// Delete the document remotely.
    Delete,
}

impl OperationKind {
    /// Returns the stable text tag used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// Parses the stable text tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(OperationKind::Upload),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// The document fields an operation intends to write.
///
/// `None` means "not touched". Merging two patches is last-write-wins per
/// field: the later value wins where present, otherwise the earlier one
/// is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    /// New title, if touched.
    pub title: Option<String>,
    /// New description, if touched.
    pub description: Option<String>,
    /// New category, if touched.
    pub category: Option<String>,
    /// New label list, if touched.
    pub labels: Option<Vec<String>>,
}

impl DocumentPatch {
    /// Captures every content field of a document.
    pub fn from_document(document: &Document) -> Self {
        Self {
            title: Some(document.title.clone()),
            description: document.description.clone(),
            category: document.category.clone(),
            labels: Some(document.labels.clone()),
        }
    }

    /// Overlays `later` onto this patch, later values winning per field.
    pub fn merge_from(&mut self, later: &DocumentPatch) {
        if later.title.is_some() {
            self.title = later.title.clone();
        }
        if later.description.is_some() {
            self.description = later.description.clone();
        }
        if later.category.is_some() {
            self.category = later.category.clone();
        }
        if later.labels.is_some() {
            self.labels = later.labels.clone();
        }
    }

    /// Writes the touched fields onto a document.
    pub fn apply_to(&self, document: &mut Document) {
        if let Some(title) = &self.title {
            document.set_title(title.clone());
        }
        if self.description.is_some() {
            document.set_description(self.description.clone());
        }
        if self.category.is_some() {
            document.set_category(self.category.clone());
        }
        if let Some(labels) = &self.labels {
            document.set_labels(labels.clone());
        }
    }
}

/// A queued work item: one operation destined for the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Target document identifier.
    pub sync_id: SyncId,
    /// Fields the operation writes (empty for deletes).
    pub patch: DocumentPatch,
    /// Enqueue time, epoch milliseconds.
    pub enqueued_at: i64,
    /// Scheduling priority; higher runs earlier.
    pub priority: u8,
}

impl QueuedOperation {
    /// Creates an upload operation carrying the full document content.
    pub fn upload(document: &Document) -> Self {
        Self {
            kind: OperationKind::Upload,
            sync_id: document.sync_id.clone(),
            patch: DocumentPatch::from_document(document),
            enqueued_at: now_millis(),
            priority: 0,
        }
    }

    /// Creates an update operation for the touched fields.
    pub fn update(sync_id: SyncId, patch: DocumentPatch) -> Self {
        Self {
            kind: OperationKind::Update,
            sync_id,
            patch,
            enqueued_at: now_millis(),
            priority: 0,
        }
    }

    /// Creates a delete operation.
    pub fn delete(sync_id: SyncId) -> Self {
        Self {
            kind: OperationKind::Delete,
            sync_id,
            patch: DocumentPatch::default(),
            enqueued_at: now_millis(),
            priority: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    fn to_row(&self) -> SyncResult<QueueRow> {
        Ok(QueueRow {
            sync_id: self.sync_id.as_str().to_owned(),
            kind: self.kind.as_str().to_owned(),
            payload: serde_json::to_string(&self.patch)
                .map_err(|e| SyncError::validation(format!("unencodable patch: {e}")))?,
            enqueued_at: self.enqueued_at,
            priority: i64::from(self.priority),
        })
    }

    fn from_row(row: &QueueRow) -> SyncResult<Self> {
        let kind = OperationKind::parse(&row.kind)
            .ok_or_else(|| SyncError::validation(format!("unknown operation kind {:?}", row.kind)))?;
        let patch = serde_json::from_str(&row.payload)
            .map_err(|e| SyncError::validation(format!("malformed queue payload: {e}")))?;
        Ok(Self {
            kind,
            sync_id: SyncId::parse(&row.sync_id).map_err(SyncError::from)?,
            patch,
            enqueued_at: row.enqueued_at,
            priority: row.priority.clamp(0, i64::from(u8::MAX)) as u8,
        })
    }
}

/// Outcome of a consolidation pass, for testing and telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Queue length before consolidation.
    pub original_count: usize,
    /// Queue length after consolidation.
    pub final_count: usize,
    /// Operations eliminated, per identifier (only identifiers that
    /// actually shrank appear).
    pub reduced_per_id: HashMap<SyncId, usize>,
}

/// The pending operation queue.
///
/// In-memory, with optional write-through persistence for crash
/// durability when constructed over a store.
pub struct SyncQueue {
    ops: Mutex<Vec<QueuedOperation>>,
    store: Option<Arc<LocalStore>>,
}

impl SyncQueue {
    /// Creates an in-memory queue without durability.
    pub fn in_memory() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            store: None,
        }
    }

    /// Creates a durable queue, restoring any persisted entries.
    pub fn with_store(store: Arc<LocalStore>) -> SyncResult<Self> {
        let rows = store.queue_load()?;
        let mut ops = Vec::with_capacity(rows.len());
        for row in &rows {
            ops.push(QueuedOperation::from_row(row)?);
        }
        Ok(Self {
            ops: Mutex::new(ops),
            store: Some(store),
        })
    }

    /// Appends an operation.
    pub fn enqueue(&self, op: QueuedOperation) -> SyncResult<()> {
        if let Some(store) = &self.store {
            store.queue_append(&op.to_row()?)?;
        }
        self.ops.lock().push(op);
        Ok(())
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Returns a snapshot of the queue in scheduling order.
    pub fn operations(&self) -> Vec<QueuedOperation> {
        self.ops.lock().clone()
    }

    /// Removes every entry for one identifier.
    pub fn remove(&self, sync_id: &SyncId) -> SyncResult<()> {
        self.ops.lock().retain(|op| &op.sync_id != sync_id);
        if let Some(store) = &self.store {
            store.queue_remove(sync_id)?;
        }
        Ok(())
    }

    /// Drops everything, including persisted entries.
    pub fn clear(&self) -> SyncResult<()> {
        self.ops.lock().clear();
        if let Some(store) = &self.store {
            store.queue_replace(&[])?;
        }
        Ok(())
    }

    /// Reduces each identifier's operations to at most one.
    ///
    /// Rules, applied in enqueue order per identifier:
    /// - a delete overrides and discards everything before it;
    /// - an upload/update after a delete replaces the delete (re-creation);
    /// - consecutive uploads/updates merge: patches last-write-wins per
    ///   field, the kind stays upload if any member was an upload, priority
    ///   is the maximum, and the earliest enqueue time is kept.
    ///
    /// The surviving operations are ordered by priority (descending) then
    /// enqueue time, and the persisted queue is rewritten to match.
    pub fn consolidate(&self) -> SyncResult<ConsolidationReport> {
        let mut ops = self.ops.lock();
        let original_count = ops.len();

        // Group by identifier, preserving first-seen order.
        let mut order: Vec<SyncId> = Vec::new();
        let mut groups: HashMap<SyncId, Vec<QueuedOperation>> = HashMap::new();
        let mut sorted: Vec<QueuedOperation> = std::mem::take(&mut *ops);
        sorted.sort_by_key(|op| op.enqueued_at);
        for op in sorted {
            if !groups.contains_key(&op.sync_id) {
                order.push(op.sync_id.clone());
            }
            groups.entry(op.sync_id.clone()).or_default().push(op);
        }

        let mut reduced_per_id = HashMap::new();
        let mut result: Vec<QueuedOperation> = Vec::with_capacity(order.len());
        for sync_id in order {
            let group = groups.remove(&sync_id).unwrap_or_default();
            let group_len = group.len();
            if let Some(survivor) = reduce_group(group) {
                if group_len > 1 {
                    reduced_per_id.insert(sync_id, group_len - 1);
                }
                result.push(survivor);
            } else if group_len > 0 {
                reduced_per_id.insert(sync_id, group_len);
            }
        }

        result.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });

        let report = ConsolidationReport {
            original_count,
            final_count: result.len(),
            reduced_per_id,
        };
        *ops = result;

        // Memory first: a failed rewrite leaves the pre-consolidation rows
        // on disk, which simply re-consolidate on the next load.
        if let Some(store) = &self.store {
            let mut rows = Vec::with_capacity(ops.len());
            for op in ops.iter() {
                rows.push(op.to_row()?);
            }
            store.queue_replace(&rows)?;
        }
        tracing::debug!(
            original = report.original_count,
            consolidated = report.final_count,
            "queue consolidated"
        );
        Ok(report)
    }
}

/// Reduces one identifier's operations (in enqueue order) to at most one.
fn reduce_group(group: Vec<QueuedOperation>) -> Option<QueuedOperation> {
    let mut acc: Option<QueuedOperation> = None;
    for op in group {
        acc = Some(match acc {
            None => op,
            Some(prev) => match (prev.kind, op.kind) {
                // A delete discards everything queued before it.
                (_, OperationKind::Delete) => op,
                // A write after a delete is a re-creation.
                (OperationKind::Delete, _) => op,
                _ => {
                    let mut patch = prev.patch.clone();
                    patch.merge_from(&op.patch);
                    QueuedOperation {
                        kind: if prev.kind == OperationKind::Upload
                            || op.kind == OperationKind::Upload
                        {
                            OperationKind::Upload
                        } else {
                            OperationKind::Update
                        },
                        sync_id: prev.sync_id,
                        patch,
                        enqueued_at: prev.enqueued_at.min(op.enqueued_at),
                        priority: prev.priority.max(op.priority),
                    }
                }
            },
        });
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperstack_core::Document;
    use proptest::prelude::*;

    fn patch(title: &str) -> DocumentPatch {
        DocumentPatch {
            title: Some(title.into()),
            ..DocumentPatch::default()
        }
    }

    fn op(kind: OperationKind, id: &SyncId, title: &str, at: i64) -> QueuedOperation {
        QueuedOperation {
            kind,
            sync_id: id.clone(),
            patch: patch(title),
            enqueued_at: at,
            priority: 0,
        }
    }

    #[test]
    fn upload_then_update_merges_to_one_upload() {
        let queue = SyncQueue::in_memory();
        let id = SyncId::generate();
        queue
            .enqueue(op(OperationKind::Upload, &id, "Rent", 1))
            .unwrap();
        queue
            .enqueue(op(OperationKind::Update, &id, "Rent 2024", 2))
            .unwrap();

        let report = queue.consolidate().unwrap();
        assert_eq!(report.original_count, 2);
        assert_eq!(report.final_count, 1);
        assert_eq!(report.reduced_per_id.get(&id), Some(&1));

        let ops = queue.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Upload);
        assert_eq!(ops[0].patch.title.as_deref(), Some("Rent 2024"));
        assert_eq!(ops[0].enqueued_at, 1);
    }

    #[test]
    fn delete_overrides_preceding_writes() {
        let queue = SyncQueue::in_memory();
        let id = SyncId::generate();
        queue
            .enqueue(op(OperationKind::Upload, &id, "a", 1))
            .unwrap();
        queue
            .enqueue(op(OperationKind::Update, &id, "b", 2))
            .unwrap();
        queue.enqueue(QueuedOperation {
            kind: OperationKind::Delete,
            sync_id: id.clone(),
            patch: DocumentPatch::default(),
            enqueued_at: 3,
            priority: 0,
        })
        .unwrap();

        let report = queue.consolidate().unwrap();
        assert_eq!(report.final_count, 1);
        let ops = queue.operations();
        assert_eq!(ops[0].kind, OperationKind::Delete);
    }

    #[test]
    fn write_after_delete_is_a_recreation() {
        let queue = SyncQueue::in_memory();
        let id = SyncId::generate();
        queue.enqueue(QueuedOperation {
            kind: OperationKind::Delete,
            sync_id: id.clone(),
            patch: DocumentPatch::default(),
            enqueued_at: 1,
            priority: 0,
        })
        .unwrap();
        queue
            .enqueue(op(OperationKind::Upload, &id, "fresh", 2))
            .unwrap();

        queue.consolidate().unwrap();
        let ops = queue.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Upload);
        assert_eq!(ops[0].patch.title.as_deref(), Some("fresh"));
    }

    #[test]
    fn merge_is_last_write_wins_per_field() {
        let queue = SyncQueue::in_memory();
        let id = SyncId::generate();
        queue.enqueue(QueuedOperation {
            kind: OperationKind::Update,
            sync_id: id.clone(),
            patch: DocumentPatch {
                title: Some("old title".into()),
                description: Some("keep me".into()),
                ..DocumentPatch::default()
            },
            enqueued_at: 1,
            priority: 1,
        })
        .unwrap();
        queue.enqueue(QueuedOperation {
            kind: OperationKind::Update,
            sync_id: id.clone(),
            patch: DocumentPatch {
                title: Some("new title".into()),
                labels: Some(vec!["tax".into()]),
                ..DocumentPatch::default()
            },
            enqueued_at: 2,
            priority: 3,
        })
        .unwrap();

        queue.consolidate().unwrap();
        let ops = queue.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[0].patch.title.as_deref(), Some("new title"));
        assert_eq!(ops[0].patch.description.as_deref(), Some("keep me"));
        assert_eq!(ops[0].patch.labels, Some(vec!["tax".to_string()]));
        assert_eq!(ops[0].priority, 3);
        assert_eq!(ops[0].enqueued_at, 1);
    }

    #[test]
    fn fifo_fairness_across_identifiers() {
        let queue = SyncQueue::in_memory();
        let first = SyncId::generate();
        let second = SyncId::generate();
        queue
            .enqueue(op(OperationKind::Upload, &first, "first", 1))
            .unwrap();
        queue
            .enqueue(op(OperationKind::Upload, &second, "second", 2))
            .unwrap();
        // A later update must not push `first` behind `second`.
        queue
            .enqueue(op(OperationKind::Update, &first, "first v2", 3))
            .unwrap();

        queue.consolidate().unwrap();
        let ops = queue.operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].sync_id, first);
        assert_eq!(ops[1].sync_id, second);
    }

    #[test]
    fn higher_priority_runs_first() {
        let queue = SyncQueue::in_memory();
        let low = SyncId::generate();
        let high = SyncId::generate();
        queue
            .enqueue(op(OperationKind::Upload, &low, "low", 1))
            .unwrap();
        queue
            .enqueue(op(OperationKind::Upload, &high, "high", 2).with_priority(5))
            .unwrap();

        queue.consolidate().unwrap();
        let ops = queue.operations();
        assert_eq!(ops[0].sync_id, high);
    }

    #[test]
    fn remove_drops_all_entries_for_identifier() {
        let queue = SyncQueue::in_memory();
        let id = SyncId::generate();
        let other = SyncId::generate();
        queue.enqueue(op(OperationKind::Upload, &id, "a", 1)).unwrap();
        queue.enqueue(op(OperationKind::Update, &id, "b", 2)).unwrap();
        queue
            .enqueue(op(OperationKind::Upload, &other, "c", 3))
            .unwrap();

        queue.remove(&id).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.operations()[0].sync_id, other);
    }

    #[test]
    fn durable_queue_restores_after_reopen() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let queue = SyncQueue::with_store(Arc::clone(&store)).unwrap();
        let doc = Document::builder("Rent").build();
        queue.enqueue(QueuedOperation::upload(&doc)).unwrap();

        // A fresh queue over the same store sees the persisted entry.
        let restored = SyncQueue::with_store(Arc::clone(&store)).unwrap();
        assert_eq!(restored.len(), 1);
        let ops = restored.operations();
        assert_eq!(ops[0].sync_id, doc.sync_id);
        assert_eq!(ops[0].patch.title.as_deref(), Some("Rent"));
    }

    #[test]
    fn durable_consolidation_rewrites_persisted_rows() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let queue = SyncQueue::with_store(Arc::clone(&store)).unwrap();
        let id = SyncId::generate();
        queue.enqueue(op(OperationKind::Upload, &id, "a", 1)).unwrap();
        queue.enqueue(op(OperationKind::Update, &id, "b", 2)).unwrap();

        queue.consolidate().unwrap();
        assert_eq!(store.queue_load().unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn writes_for_one_identifier_reduce_to_exactly_one(
            kinds in proptest::collection::vec(0u8..2, 2..20)
        ) {
            let queue = SyncQueue::in_memory();
            let id = SyncId::generate();
            for (i, k) in kinds.iter().enumerate() {
                let kind = if *k == 0 { OperationKind::Upload } else { OperationKind::Update };
                queue.enqueue(op(kind, &id, &format!("t{i}"), i as i64)).unwrap();
            }

            let report = queue.consolidate().unwrap();
            prop_assert_eq!(report.original_count, kinds.len());
            prop_assert_eq!(report.final_count, 1);
            // The survivor carries the last write.
            let ops = queue.operations();
            let last = format!("t{}", kinds.len() - 1);
            prop_assert_eq!(ops[0].patch.title.as_deref(), Some(last.as_str()));
        }

        #[test]
        fn consolidation_never_leaves_two_operations_per_identifier(
            steps in proptest::collection::vec((0u8..3, 0u8..3), 1..40)
        ) {
            let queue = SyncQueue::in_memory();
            let ids: Vec<SyncId> = (0..3).map(|_| SyncId::generate()).collect();
            for (i, (kind, which)) in steps.iter().enumerate() {
                let kind = match kind {
                    0 => OperationKind::Upload,
                    1 => OperationKind::Update,
                    _ => OperationKind::Delete,
                };
                let id = &ids[*which as usize];
                queue.enqueue(op(kind, id, &format!("t{i}"), i as i64)).unwrap();
            }

            let report = queue.consolidate().unwrap();
            let ops = queue.operations();
            prop_assert_eq!(report.final_count, ops.len());
            for id in &ids {
                let count = ops.iter().filter(|o| &o.sync_id == id).count();
                prop_assert!(count <= 1);
            }
        }
    }
}
