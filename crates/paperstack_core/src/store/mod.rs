//! SQLite-backed local store.
//!
//! One connection per process, serialized behind a mutex. All mutating
//! operations run inside a single transaction; a failed transaction leaves
//! prior state untouched. Deleting a document cascades its attachments in
//! the same transaction.

mod migrations;

use crate::document::{now_millis, Document, FileAttachment, SyncState};
use crate::error::{CoreError, CoreResult};
use crate::id::SyncId;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const WATERMARK_KEY: &str = "download_watermark";

/// A persisted sync-queue row.
///
/// The store persists queue entries opaquely; the engine owns their
/// payload encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    /// Target document identifier.
    pub sync_id: String,
    /// Operation kind tag.
    pub kind: String,
    /// JSON payload.
    pub payload: String,
    /// Enqueue time, epoch milliseconds.
    pub enqueued_at: i64,
    /// Scheduling priority.
    pub priority: i64,
}

/// Durable, transactional storage for documents, attachments, the pending
/// operation queue, conflict snapshots, and the download watermark.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Opens (or creates) a store at the given path and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    /// Opens an in-memory store, mostly for tests.
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn)
    }

    fn bootstrap(mut conn: Connection) -> CoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::apply_migrations(&mut conn)?;
        tracing::debug!("local store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- documents ----

    /// Inserts a new document.
    ///
    /// Fails with [`CoreError::Constraint`] when the identifier already
    /// exists.
    pub fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        let conn = self.conn.lock();
        let labels = serde_json::to_string(&doc.labels)?;
        conn.execute(
            "INSERT INTO documents
                (sync_id, title, description, category, labels,
                 created_at, updated_at, sync_state, version, conflict_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                doc.sync_id.as_str(),
                doc.title,
                doc.description,
                doc.category,
                labels,
                doc.created_at,
                doc.updated_at,
                doc.sync_state.as_str(),
                doc.version,
                doc.conflict_id,
            ],
        )
        .map_err(|e| map_constraint(e, || format!("duplicate sync_id {}", doc.sync_id)))?;
        Ok(())
    }

    /// Loads a document, failing with [`CoreError::NotFound`] when absent.
    pub fn get_document(&self, sync_id: &SyncId) -> CoreResult<Document> {
        self.try_get_document(sync_id)?
            .ok_or_else(|| CoreError::not_found(sync_id.as_str()))
    }

    /// Loads a document if present.
    pub fn try_get_document(&self, sync_id: &SyncId) -> CoreResult<Option<Document>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {DOC_COLUMNS} FROM documents WHERE sync_id = ?1"),
                [sync_id.as_str()],
                raw_document,
            )
            .optional()?;
        raw.map(RawDocument::into_document).transpose()
    }

    /// Persists a document's mutable fields and refreshes `updated_at`.
    ///
    /// Never bumps `version`; incrementing the revision is an explicit
    /// caller decision via [`Document::bump_version`].
    pub fn update_document(&self, doc: &mut Document) -> CoreResult<()> {
        doc.updated_at = now_millis();
        let conn = self.conn.lock();
        let labels = serde_json::to_string(&doc.labels)?;
        let changed = conn.execute(
            "UPDATE documents
             SET title = ?2, description = ?3, category = ?4, labels = ?5,
                 updated_at = ?6, sync_state = ?7, version = ?8, conflict_id = ?9
             WHERE sync_id = ?1",
            params![
                doc.sync_id.as_str(),
                doc.title,
                doc.description,
                doc.category,
                labels,
                doc.updated_at,
                doc.sync_state.as_str(),
                doc.version,
                doc.conflict_id,
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found(doc.sync_id.as_str()));
        }
        Ok(())
    }

    /// Inserts or overwrites a document as delivered by the remote.
    ///
    /// Unlike [`LocalStore::update_document`] this takes the row verbatim,
    /// including `updated_at` and `version`, and does not require the
    /// document to exist.
    pub fn upsert_document(&self, doc: &Document) -> CoreResult<()> {
        let conn = self.conn.lock();
        let labels = serde_json::to_string(&doc.labels)?;
        conn.execute(
            "INSERT INTO documents
                (sync_id, title, description, category, labels,
                 created_at, updated_at, sync_state, version, conflict_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(sync_id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                category = excluded.category,
                labels = excluded.labels,
                updated_at = excluded.updated_at,
                sync_state = excluded.sync_state,
                version = excluded.version,
                conflict_id = excluded.conflict_id",
            params![
                doc.sync_id.as_str(),
                doc.title,
                doc.description,
                doc.category,
                labels,
                doc.created_at,
                doc.updated_at,
                doc.sync_state.as_str(),
                doc.version,
                doc.conflict_id,
            ],
        )?;
        Ok(())
    }

    /// Deletes a document and, in the same transaction, all its attachments.
    pub fn delete_document(&self, sync_id: &SyncId) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // FK cascade removes the attachment rows with the parent.
        let changed = tx.execute(
            "DELETE FROM documents WHERE sync_id = ?1",
            [sync_id.as_str()],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found(sync_id.as_str()));
        }
        tx.execute(
            "DELETE FROM conflict_snapshots WHERE sync_id = ?1",
            [sync_id.as_str()],
        )?;
        tx.commit()?;
        tracing::debug!(sync_id = %sync_id, "deleted document with attachments");
        Ok(())
    }

    /// Returns all documents, ordered by creation time.
    pub fn list_documents(&self) -> CoreResult<Vec<Document>> {
        self.query_documents("ORDER BY created_at, sync_id", [])
    }

    /// Returns documents in the given sync state.
    pub fn documents_by_state(&self, state: SyncState) -> CoreResult<Vec<Document>> {
        self.query_documents(
            "WHERE sync_state = ?1 ORDER BY created_at, sync_id",
            [state.as_str()],
        )
    }

    /// Returns documents whose local changes still need a remote send
    /// (state is `PendingUpload` or `Error`).
    pub fn documents_needing_upload(&self) -> CoreResult<Vec<Document>> {
        self.query_documents(
            "WHERE sync_state IN ('pending_upload', 'error') ORDER BY created_at, sync_id",
            [],
        )
    }

    /// Returns documents with at least one attachment that exists remotely
    /// but has no local path yet.
    pub fn documents_needing_download(&self) -> CoreResult<Vec<Document>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT DISTINCT {DOC_COLUMNS} FROM documents d
             JOIN file_attachments a ON a.owner_sync_id = d.sync_id
             WHERE a.remote_key IS NOT NULL AND a.local_path IS NULL
             ORDER BY d.created_at, d.sync_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], raw_document)?;
        collect_documents(rows)
    }

    /// Moves a document to `next`, enforcing the state machine.
    pub fn set_sync_state(&self, sync_id: &SyncId, next: SyncState) -> CoreResult<SyncState> {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT sync_state FROM documents WHERE sync_id = ?1",
                [sync_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .as_deref()
            .and_then(SyncState::parse)
            .ok_or_else(|| CoreError::not_found(sync_id.as_str()))?;
        if !current.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        conn.execute(
            "UPDATE documents SET sync_state = ?2 WHERE sync_id = ?1",
            params![sync_id.as_str(), next.as_str()],
        )?;
        tracing::debug!(sync_id = %sync_id, from = current.as_str(), to = next.as_str(), "sync state changed");
        Ok(current)
    }

    // ---- conflict bookkeeping ----

    /// Stores the conflicting remote snapshot and suspends the document:
    /// `sync_state` forced to `Error` with `conflict_id` pointing at the
    /// snapshot row, in one transaction. Returns the snapshot id.
    pub fn mark_conflict(&self, sync_id: &SyncId, remote: &Document) -> CoreResult<i64> {
        let payload = serde_json::to_string(remote)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conflict_snapshots (sync_id, payload, detected_at)
             VALUES (?1, ?2, ?3)",
            params![sync_id.as_str(), payload, now_millis()],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        let changed = tx.execute(
            "UPDATE documents SET sync_state = 'error', conflict_id = ?2 WHERE sync_id = ?1",
            params![sync_id.as_str(), snapshot_id],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found(sync_id.as_str()));
        }
        tx.commit()?;
        tracing::warn!(sync_id = %sync_id, snapshot_id, "conflict suspended");
        Ok(snapshot_id)
    }

    /// Loads a stored conflicting remote snapshot.
    pub fn conflict_snapshot(&self, snapshot_id: i64) -> CoreResult<Option<Document>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM conflict_snapshots WHERE id = ?1",
                [snapshot_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(CoreError::from))
            .transpose()
    }

    /// Drops a document's conflict marker and its stored snapshot.
    ///
    /// The sync state is left untouched; the caller decides where the
    /// resolution moves the document next.
    pub fn clear_conflict(&self, sync_id: &SyncId) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE documents SET conflict_id = NULL WHERE sync_id = ?1",
            [sync_id.as_str()],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found(sync_id.as_str()));
        }
        tx.execute(
            "DELETE FROM conflict_snapshots WHERE sync_id = ?1",
            [sync_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- attachments ----

    /// Inserts or updates an attachment.
    ///
    /// Fails with [`CoreError::NotFound`] when the owning document is
    /// absent.
    pub fn put_attachment(&self, attachment: &FileAttachment) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let owner_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM documents WHERE sync_id = ?1",
                [attachment.owner.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if owner_exists.is_none() {
            return Err(CoreError::not_found(attachment.owner.as_str()));
        }
        tx.execute(
            "INSERT INTO file_attachments
                (owner_sync_id, file_name, local_path, remote_key, file_size, added_at, label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(owner_sync_id, file_name) DO UPDATE SET
                local_path = excluded.local_path,
                remote_key = excluded.remote_key,
                file_size = excluded.file_size,
                label = excluded.label",
            params![
                attachment.owner.as_str(),
                attachment.file_name,
                attachment.local_path,
                attachment.remote_key,
                attachment.file_size,
                attachment.added_at,
                attachment.label,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns a document's attachments, ordered by file name.
    pub fn attachments_for(&self, sync_id: &SyncId) -> CoreResult<Vec<FileAttachment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT owner_sync_id, file_name, local_path, remote_key, file_size, added_at, label
             FROM file_attachments WHERE owner_sync_id = ?1 ORDER BY file_name",
        )?;
        let rows = stmt.query_map([sync_id.as_str()], |row| {
            Ok(RawAttachment {
                owner: row.get(0)?,
                file_name: row.get(1)?,
                local_path: row.get(2)?,
                remote_key: row.get(3)?,
                file_size: row.get(4)?,
                added_at: row.get(5)?,
                label: row.get(6)?,
            })
        })?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?.into_attachment()?);
        }
        Ok(attachments)
    }

    /// Deletes a single attachment.
    pub fn delete_attachment(&self, sync_id: &SyncId, file_name: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM file_attachments WHERE owner_sync_id = ?1 AND file_name = ?2",
            params![sync_id.as_str(), file_name],
        )?;
        if changed == 0 {
            return Err(CoreError::attachment_not_found(sync_id.as_str(), file_name));
        }
        Ok(())
    }

    // ---- queue durability ----

    /// Appends a queue row, returning its row id.
    pub fn queue_append(&self, row: &QueueRow) -> CoreResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_queue (sync_id, kind, payload, enqueued_at, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.sync_id,
                row.kind,
                row.payload,
                row.enqueued_at,
                row.priority
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Loads all queue rows in enqueue order.
    pub fn queue_load(&self) -> CoreResult<Vec<QueueRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sync_id, kind, payload, enqueued_at, priority
             FROM sync_queue ORDER BY enqueued_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueueRow {
                sync_id: row.get(0)?,
                kind: row.get(1)?,
                payload: row.get(2)?,
                enqueued_at: row.get(3)?,
                priority: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Atomically replaces the persisted queue with the given rows.
    pub fn queue_replace(&self, rows: &[QueueRow]) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sync_queue", [])?;
        for row in rows {
            tx.execute(
                "INSERT INTO sync_queue (sync_id, kind, payload, enqueued_at, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.sync_id,
                    row.kind,
                    row.payload,
                    row.enqueued_at,
                    row.priority
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes all queue rows for one identifier, returning the count.
    pub fn queue_remove(&self, sync_id: &SyncId) -> CoreResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sync_queue WHERE sync_id = ?1",
            [sync_id.as_str()],
        )?;
        Ok(removed)
    }

    // ---- meta ----

    /// Returns the last-applied download watermark (0 when never set).
    pub fn watermark(&self) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Persists the download watermark.
    pub fn set_watermark(&self, watermark: u64) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![WATERMARK_KEY, watermark.to_string()],
        )?;
        Ok(())
    }

    fn query_documents<P: rusqlite::Params>(
        &self,
        suffix: &str,
        params: P,
    ) -> CoreResult<Vec<Document>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {DOC_COLUMNS} FROM documents {suffix}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, raw_document)?;
        collect_documents(rows)
    }
}

const DOC_COLUMNS: &str = "sync_id, title, description, category, labels, \
     created_at, updated_at, sync_state, version, conflict_id";

/// Column values before labels/state/id decoding.
struct RawDocument {
    sync_id: String,
    title: String,
    description: Option<String>,
    category: Option<String>,
    labels: String,
    created_at: i64,
    updated_at: i64,
    sync_state: String,
    version: i64,
    conflict_id: Option<i64>,
}

impl RawDocument {
    fn into_document(self) -> CoreResult<Document> {
        let sync_state = SyncState::parse(&self.sync_state).ok_or_else(|| {
            CoreError::constraint(format!("malformed sync_state {:?}", self.sync_state))
        })?;
        Ok(Document {
            sync_id: SyncId::parse(&self.sync_id)?,
            title: self.title,
            description: self.description,
            category: self.category,
            labels: serde_json::from_str(&self.labels)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync_state,
            version: self.version,
            conflict_id: self.conflict_id,
        })
    }
}

fn raw_document(row: &Row<'_>) -> rusqlite::Result<RawDocument> {
    Ok(RawDocument {
        sync_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        labels: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        sync_state: row.get(7)?,
        version: row.get(8)?,
        conflict_id: row.get(9)?,
    })
}

fn collect_documents(
    rows: impl Iterator<Item = rusqlite::Result<RawDocument>>,
) -> CoreResult<Vec<Document>> {
    let mut documents = Vec::new();
    for row in rows {
        documents.push(row?.into_document()?);
    }
    Ok(documents)
}

struct RawAttachment {
    owner: String,
    file_name: String,
    local_path: Option<String>,
    remote_key: Option<String>,
    file_size: i64,
    added_at: i64,
    label: Option<String>,
}

impl RawAttachment {
    fn into_attachment(self) -> CoreResult<FileAttachment> {
        Ok(FileAttachment {
            owner: SyncId::parse(&self.owner)?,
            file_name: self.file_name,
            local_path: self.local_path,
            remote_key: self.remote_key,
            file_size: self.file_size,
            added_at: self.added_at,
            label: self.label,
        })
    }
}

fn map_constraint(error: rusqlite::Error, message: impl FnOnce() -> String) -> CoreError {
    match &error {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CoreError::constraint(message())
        }
        _ => CoreError::Storage(error),
    }
}
