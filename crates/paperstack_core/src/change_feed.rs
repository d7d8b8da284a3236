//! Document change feed.
//!
//! An explicit event channel between the sync engine and subscribers:
//! consumers either hold a bounded receiver or poll the history with a
//! cursor. There are no ambient callbacks.

use crate::id::SyncId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};

/// What happened to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEventKind {
    /// Document was created locally.
    Created,
    /// Document content was mutated locally.
    Updated,
    /// Document was deleted.
    Deleted,
    /// Document state machine moved.
    StateChanged,
    /// A version conflict was detected and suspended.
    ConflictDetected,
    /// A remote revision was applied locally.
    Downloaded,
}

/// A single change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    /// Monotonic event sequence number.
    pub sequence: u64,
    /// Affected document.
    pub sync_id: SyncId,
    /// What happened.
    pub kind: DocumentEventKind,
}

/// Fans committed document events out to subscribers and keeps a bounded
/// history for cursor-based polling.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<SyncSender<DocumentEvent>>>,
    history: RwLock<Vec<DocumentEvent>>,
    next_sequence: AtomicU64,
    max_history: usize,
    channel_capacity: usize,
}

impl ChangeFeed {
    /// Creates a feed with default bounds.
    pub fn new() -> Self {
        Self::with_bounds(4096, 256)
    }

    /// Creates a feed with explicit history and per-subscriber bounds.
    pub fn with_bounds(max_history: usize, channel_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            max_history,
            channel_capacity,
        }
    }

    /// Subscribes to future events through a bounded channel.
    ///
    /// A subscriber that stops draining its channel is dropped once the
    /// channel fills; polling remains available for catch-up.
    pub fn subscribe(&self) -> Receiver<DocumentEvent> {
        let (tx, rx) = mpsc::sync_channel(self.channel_capacity);
        self.subscribers.write().push(tx);
        rx
    }

    /// Records an event and delivers it, returning its sequence number.
    pub fn emit(&self, sync_id: SyncId, kind: DocumentEventKind) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let event = DocumentEvent {
            sequence,
            sync_id,
            kind,
        };

        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
        sequence
    }

    /// Returns events with `sequence > cursor`, up to `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<DocumentEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the newest sequence number seen (0 when empty).
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        let id = SyncId::generate();
        feed.emit(id.clone(), DocumentEventKind::Created);

        let event = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.sync_id, id);
        assert_eq!(event.kind, DocumentEventKind::Created);
        assert_eq!(event.sequence, 1);
    }

    #[test]
    fn sequences_are_monotonic() {
        let feed = ChangeFeed::new();
        let a = feed.emit(SyncId::generate(), DocumentEventKind::Created);
        let b = feed.emit(SyncId::generate(), DocumentEventKind::Updated);
        assert!(b > a);
        assert_eq!(feed.latest_sequence(), b);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = ChangeFeed::new();
        for _ in 0..5 {
            feed.emit(SyncId::generate(), DocumentEventKind::Updated);
        }

        let events = feed.poll(2, 10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, 3);

        assert_eq!(feed.poll(0, 2).len(), 2);
    }

    #[test]
    fn disconnected_subscriber_is_dropped() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(SyncId::generate(), DocumentEventKind::Deleted);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_is_dropped_once_full() {
        let feed = ChangeFeed::with_bounds(100, 2);
        let _rx = feed.subscribe();

        for _ in 0..3 {
            feed.emit(SyncId::generate(), DocumentEventKind::Updated);
        }
        // Two events fit in the channel; the third send fails and evicts.
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_bounds(3, 8);
        for _ in 0..10 {
            feed.emit(SyncId::generate(), DocumentEventKind::Updated);
        }
        let events = feed.poll(0, 100);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, 8);
    }
}
