//! # Paperstack Core
//!
//! Data model and local persistence for the Paperstack document manager:
//!
//! - Sync identifiers (generate/validate/normalize)
//! - The `Document` / `FileAttachment` model and per-document sync state
//!   machine
//! - The SQLite-backed transactional local store (documents, attachments,
//!   pending operation queue, conflict snapshots, download watermark)
//! - A change feed for observing document events
//!
//! ## Key invariants
//!
//! - `sync_id` is unique across the store and immutable
//! - `version` is monotonic and bumped only by an explicit caller decision
//! - State transitions follow the sync state machine; invalid edges are
//!   rejected, never silently ignored
//! - Deleting a document cascades its attachments in the same transaction

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod document;
mod error;
mod id;
mod store;

pub use change_feed::{ChangeFeed, DocumentEvent, DocumentEventKind};
pub use document::{now_millis, Document, DocumentBuilder, FileAttachment, SyncState};
pub use error::{CoreError, CoreResult};
pub use id::SyncId;
pub use store::{LocalStore, QueueRow};
