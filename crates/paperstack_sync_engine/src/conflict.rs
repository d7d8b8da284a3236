//! Conflict detection and resolution.
//!
//! A conflict exists when a remote write cannot be applied over the local
//! revision without losing something: the versions diverged, or the same
//! version carries different content. Detection never overwrites
//! silently; an unresolved conflict suspends the identifier until a
//! caller picks a strategy.

use crate::error::{SyncError, SyncResult};
use paperstack_core::{now_millis, Document, SyncId, SyncState};

/// How to resolve a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Re-submit the local snapshot over the remote one.
    KeepLocal,
    /// Accept the remote snapshot, discarding local pending changes.
    KeepRemote,
    /// Merge field-by-field, newest content winning.
    Merge,
    /// Keep the remote under the original identifier and re-create the
    /// local snapshot under a fresh one.
    KeepBoth,
}

/// The outcome of applying a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// One document survives under the original identifier.
    Single {
        /// The surviving document.
        document: Document,
        /// True when the document must be re-submitted to the remote.
        resubmit: bool,
    },
    /// Both snapshots survive: the remote under the original identifier,
    /// the local under a freshly generated one.
    Both {
        /// Remote snapshot, kept under the original identifier.
        retained: Document,
        /// Local snapshot, re-identified and re-queued as a new upload.
        reassigned: Document,
    },
}

/// Stateless conflict detection and resolution.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Returns true when applying `remote` over `local` would be a
    /// conflict rather than a clean apply.
    ///
    /// - equal versions with differing content conflict (never a silent
    ///   overwrite);
    /// - a remote ahead of a locally-dirty document conflicts;
    /// - a remote behind the local version conflicts (the remote must
    ///   never regress the local revision).
    pub fn conflicts_with(local: &Document, remote: &Document) -> bool {
        if remote.version == local.version {
            return !Self::content_matches(local, remote);
        }
        if remote.version > local.version {
            return local.sync_state.is_locally_dirty();
        }
        true
    }

    /// Compares the user-visible content of two snapshots.
    fn content_matches(a: &Document, b: &Document) -> bool {
        a.title == b.title
            && a.description == b.description
            && a.category == b.category
            && a.labels == b.labels
    }

    /// Applies a resolution strategy to a suspended conflict.
    pub fn resolve(
        local: &Document,
        remote: &Document,
        strategy: ResolutionStrategy,
    ) -> SyncResult<Resolution> {
        if local.sync_id != remote.sync_id {
            return Err(SyncError::validation(
                "conflict snapshots must share an identifier",
            ));
        }
        match strategy {
            ResolutionStrategy::KeepLocal => {
                let mut document = local.clone();
                document.version = remote.version + 1;
                document.sync_state = SyncState::PendingUpload;
                document.conflict_id = None;
                Ok(Resolution::Single {
                    document,
                    resubmit: true,
                })
            }
            ResolutionStrategy::KeepRemote => {
                let mut document = remote.clone();
                document.sync_state = SyncState::Synced;
                document.conflict_id = None;
                Ok(Resolution::Single {
                    document,
                    resubmit: false,
                })
            }
            ResolutionStrategy::Merge => {
                let mut document = Self::merge(local, remote);
                document.version = local.version.max(remote.version) + 1;
                document.sync_state = SyncState::PendingUpload;
                document.conflict_id = None;
                Ok(Resolution::Single {
                    document,
                    resubmit: true,
                })
            }
            ResolutionStrategy::KeepBoth => {
                let mut retained = remote.clone();
                retained.sync_state = SyncState::Synced;
                retained.conflict_id = None;

                let mut reassigned = local.clone();
                reassigned.sync_id = SyncId::generate();
                reassigned.version = 1;
                reassigned.sync_state = SyncState::PendingUpload;
                reassigned.conflict_id = None;
                reassigned.updated_at = now_millis();

                Ok(Resolution::Both {
                    retained,
                    reassigned,
                })
            }
        }
    }

    /// Field-level merge: each field comes from the side with the newer
    /// `updated_at`, falling back to the older side where unset; labels
    /// are unioned, newer side first.
    fn merge(local: &Document, remote: &Document) -> Document {
        let (newer, older) = if local.updated_at >= remote.updated_at {
            (local, remote)
        } else {
            (remote, local)
        };

        let mut labels = newer.labels.clone();
        for label in &older.labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        Document {
            sync_id: local.sync_id.clone(),
            title: newer.title.clone(),
            description: newer.description.clone().or_else(|| older.description.clone()),
            category: newer.category.clone().or_else(|| older.category.clone()),
            labels,
            created_at: local.created_at.min(remote.created_at),
            updated_at: newer.updated_at,
            sync_state: local.sync_state,
            version: local.version,
            conflict_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperstack_core::Document;

    fn pair() -> (Document, Document) {
        let local = Document::builder("Rent").build();
        let mut remote = local.clone();
        remote.sync_state = SyncState::Synced;
        (local, remote)
    }

    #[test]
    fn same_version_same_content_is_clean() {
        let (local, remote) = pair();
        assert!(!ConflictResolver::conflicts_with(&local, &remote));
    }

    #[test]
    fn same_version_different_content_conflicts() {
        let (local, mut remote) = pair();
        remote.title = "Rent (edited elsewhere)".into();
        assert!(ConflictResolver::conflicts_with(&local, &remote));
    }

    #[test]
    fn remote_ahead_of_dirty_local_conflicts() {
        let (local, mut remote) = pair();
        remote.version = local.version + 1;
        remote.title = "Rent v2".into();
        // local is PendingUpload, so the remote advance collides.
        assert!(ConflictResolver::conflicts_with(&local, &remote));
    }

    #[test]
    fn remote_ahead_of_synced_local_is_clean() {
        let (mut local, mut remote) = pair();
        local.sync_state = SyncState::Synced;
        remote.version = local.version + 1;
        assert!(!ConflictResolver::conflicts_with(&local, &remote));
    }

    #[test]
    fn remote_behind_local_conflicts() {
        let (mut local, remote) = pair();
        local.version = remote.version + 2;
        assert!(ConflictResolver::conflicts_with(&local, &remote));
    }

    #[test]
    fn keep_local_resubmits_above_remote_version() {
        let (mut local, mut remote) = pair();
        local.title = "mine".into();
        remote.title = "theirs".into();
        remote.version = 7;

        let resolution =
            ConflictResolver::resolve(&local, &remote, ResolutionStrategy::KeepLocal).unwrap();
        match resolution {
            Resolution::Single { document, resubmit } => {
                assert!(resubmit);
                assert_eq!(document.title, "mine");
                assert_eq!(document.version, 8);
                assert_eq!(document.sync_state, SyncState::PendingUpload);
                assert!(document.conflict_id.is_none());
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn keep_remote_overwrites_local() {
        let (mut local, mut remote) = pair();
        local.title = "mine".into();
        remote.title = "theirs".into();
        remote.version = 3;

        let resolution =
            ConflictResolver::resolve(&local, &remote, ResolutionStrategy::KeepRemote).unwrap();
        match resolution {
            Resolution::Single { document, resubmit } => {
                assert!(!resubmit);
                assert_eq!(document.title, "theirs");
                assert_eq!(document.version, 3);
                assert_eq!(document.sync_state, SyncState::Synced);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn merge_takes_newer_fields_and_unions_labels() {
        let (mut local, mut remote) = pair();
        local.title = "mine".into();
        local.labels = vec!["home".into()];
        local.updated_at = 2_000;
        local.version = 4;
        remote.title = "theirs".into();
        remote.description = Some("remote notes".into());
        remote.labels = vec!["bills".into(), "home".into()];
        remote.updated_at = 1_000;
        remote.version = 6;

        let resolution =
            ConflictResolver::resolve(&local, &remote, ResolutionStrategy::Merge).unwrap();
        match resolution {
            Resolution::Single { document, resubmit } => {
                assert!(resubmit);
                // local is newer: its title wins, the remote description
                // fills the gap, labels are unioned.
                assert_eq!(document.title, "mine");
                assert_eq!(document.description.as_deref(), Some("remote notes"));
                assert_eq!(
                    document.labels,
                    vec!["home".to_string(), "bills".to_string()]
                );
                assert_eq!(document.version, 7);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn keep_both_reassigns_the_local_snapshot() {
        let (mut local, mut remote) = pair();
        local.title = "mine".into();
        remote.title = "theirs".into();
        remote.version = 5;

        let resolution =
            ConflictResolver::resolve(&local, &remote, ResolutionStrategy::KeepBoth).unwrap();
        match resolution {
            Resolution::Both {
                retained,
                reassigned,
            } => {
                assert_eq!(retained.sync_id, remote.sync_id);
                assert_eq!(retained.title, "theirs");
                assert_eq!(retained.sync_state, SyncState::Synced);

                assert_ne!(reassigned.sync_id, local.sync_id);
                assert_eq!(reassigned.title, "mine");
                assert_eq!(reassigned.version, 1);
                assert_eq!(reassigned.sync_state, SyncState::PendingUpload);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn mismatched_identifiers_are_rejected() {
        let (local, _) = pair();
        let other = Document::builder("Other").build();
        let err =
            ConflictResolver::resolve(&local, &other, ResolutionStrategy::KeepLocal).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
