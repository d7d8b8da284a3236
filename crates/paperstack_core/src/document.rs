//! Document and attachment model.

use crate::error::{CoreError, CoreResult};
use crate::id::SyncId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-document synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local changes exist that have not been sent to the remote.
    PendingUpload,
    /// A remote send for this document is in flight.
    Uploading,
    /// A newer remote revision exists that has not been fetched.
    PendingDownload,
    /// A remote fetch for this document is in flight.
    Downloading,
    /// Local and remote are at the same revision.
    Synced,
    /// The last sync attempt failed or a conflict is suspended.
    Error,
}

impl SyncState {
    /// Returns the stable text form used in the persisted schema.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::PendingUpload => "pending_upload",
            SyncState::Uploading => "uploading",
            SyncState::PendingDownload => "pending_download",
            SyncState::Downloading => "downloading",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }

    /// Parses the stable text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_upload" => Some(SyncState::PendingUpload),
            "uploading" => Some(SyncState::Uploading),
            "pending_download" => Some(SyncState::PendingDownload),
            "downloading" => Some(SyncState::Downloading),
            "synced" => Some(SyncState::Synced),
            "error" => Some(SyncState::Error),
            _ => None,
        }
    }

    /// Returns true if `next` is a legal edge from this state.
    ///
    /// The machine admits exactly:
    /// - `PendingUpload → Uploading` (dequeued for remote send)
    /// - `Uploading → Synced` (confirmed) and `Uploading → Error` (rejected)
    /// - `Error → PendingUpload` (manual or entitlement-triggered retry)
    /// - `Synced → PendingUpload` (new local mutation re-arms sync)
    /// - `Synced → PendingDownload` (remote-originated change observed)
    /// - `PendingDownload → Downloading → Synced` (fetch path)
    #[must_use]
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (PendingUpload, Uploading)
                | (Uploading, Synced)
                | (Uploading, Error)
                | (Error, PendingUpload)
                | (Synced, PendingUpload)
                | (Synced, PendingDownload)
                | (PendingDownload, Downloading)
                | (Downloading, Synced)
        )
    }

    /// Returns true if the document carries local changes the remote has
    /// not accepted yet.
    #[must_use]
    pub fn is_locally_dirty(self) -> bool {
        matches!(
            self,
            SyncState::PendingUpload | SyncState::Uploading | SyncState::Error
        )
    }
}

/// A user document: metadata plus zero or more file attachments.
///
/// `version` is monotonic and bumped only through [`Document::bump_version`];
/// every content mutation refreshes `updated_at`. State changes go through
/// [`Document::transition`], which rejects edges not in the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable sync identifier (immutable).
    pub sync_id: SyncId,
    /// Document title.
    pub title: String,
    /// Optional free-form notes.
    pub description: Option<String>,
    /// Optional free-tag category.
    pub category: Option<String>,
    /// Ordered user labels.
    pub labels: Vec<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last content modification time, epoch milliseconds.
    pub updated_at: i64,
    /// Synchronization state.
    pub sync_state: SyncState,
    /// Monotonic revision counter, incremented once per accepted mutation.
    pub version: i64,
    /// Row id of a stored conflicting remote snapshot, when suspended.
    pub conflict_id: Option<i64>,
}

impl Document {
    /// Starts building a new document with the given title.
    #[must_use]
    pub fn builder(title: impl Into<String>) -> DocumentBuilder {
        DocumentBuilder::new(title)
    }

    /// Replaces the title and refreshes `updated_at`.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.updated_at = now_millis();
    }

    /// Replaces the description and refreshes `updated_at`.
    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
        self.updated_at = now_millis();
    }

    /// Replaces the category and refreshes `updated_at`.
    pub fn set_category(&mut self, category: Option<String>) {
        self.category = category;
        self.updated_at = now_millis();
    }

    /// Replaces the label list and refreshes `updated_at`.
    pub fn set_labels(&mut self, labels: Vec<String>) {
        self.labels = labels;
        self.updated_at = now_millis();
    }

    /// Increments the revision counter.
    ///
    /// This is the only way `version` changes; it marks the current
    /// content as a new syncable revision.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Moves the document to `next`, rejecting edges not in the machine.
    pub fn transition(&mut self, next: SyncState) -> CoreResult<()> {
        if !self.sync_state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.sync_state,
                to: next,
            });
        }
        self.sync_state = next;
        Ok(())
    }
}

/// Builder for [`Document`].
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    title: String,
    description: Option<String>,
    category: Option<String>,
    labels: Vec<String>,
}

impl DocumentBuilder {
    /// Creates a builder with the required title.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            category: None,
            labels: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the category tag.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the label list.
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Builds the document at version 1 in `PendingUpload`.
    #[must_use]
    pub fn build(self) -> Document {
        let now = now_millis();
        Document {
            sync_id: SyncId::generate(),
            title: self.title,
            description: self.description,
            category: self.category,
            labels: self.labels,
            created_at: now,
            updated_at: now,
            sync_state: SyncState::PendingUpload,
            version: 1,
            conflict_id: None,
        }
    }
}

/// A file attached to a document.
///
/// Identified by the (owner sync id, file name) pair. At least one of
/// `local_path` / `remote_key` is non-null after creation; the remote key
/// is set only after a confirmed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// Owning document identifier.
    pub owner: SyncId,
    /// File name, unique per owner.
    pub file_name: String,
    /// Path on the local filesystem, if present locally.
    pub local_path: Option<String>,
    /// Remote object key, set after a confirmed upload.
    pub remote_key: Option<String>,
    /// File size in bytes.
    pub file_size: i64,
    /// Time the attachment was added, epoch milliseconds.
    pub added_at: i64,
    /// Optional user label.
    pub label: Option<String>,
}

impl FileAttachment {
    /// Creates an attachment.
    ///
    /// Fails with [`CoreError::Constraint`] when neither a local path nor
    /// a remote key is given.
    pub fn new(
        owner: SyncId,
        file_name: impl Into<String>,
        local_path: Option<String>,
        remote_key: Option<String>,
        file_size: i64,
    ) -> CoreResult<Self> {
        if local_path.is_none() && remote_key.is_none() {
            return Err(CoreError::constraint(
                "attachment requires a local path or a remote key",
            ));
        }
        Ok(Self {
            owner,
            file_name: file_name.into(),
            local_path,
            remote_key,
            file_size,
            added_at: now_millis(),
            label: None,
        })
    }

    /// Sets the user label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Records the remote object key after a confirmed upload.
    pub fn confirm_upload(&mut self, remote_key: impl Into<String>) {
        self.remote_key = Some(remote_key.into());
    }

    /// Returns true if the file exists remotely but not locally.
    #[must_use]
    pub fn needs_download(&self) -> bool {
        self.remote_key.is_some() && self.local_path.is_none()
    }
}
