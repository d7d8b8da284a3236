//! # Paperstack Sync Engine
//!
//! Offline-first reconciliation between the local document store and a
//! remote backend.
//!
//! This crate provides:
//! - Pending operation queue with per-identifier consolidation
//! - Entitlement gating with a fail-safe cached subscription check
//! - Conflict detection and the four resolution strategies
//! - Remote adapter abstraction (the wire protocol stays outside)
//! - Sync orchestration: consolidated uploads, watermark downloads,
//!   retry with exponential backoff, cooperative cancellation
//! - Session-level identity switching
//!
//! ## Key invariants
//!
//! - Consolidation leaves at most one operation per identifier
//! - The entitlement gate fails safe: an unreachable provider with a
//!   cold cache denies cloud sync, and never blocks local work
//! - A version mismatch is suspended for resolution, never silently
//!   overwritten
//! - Operations on one identifier are strictly serialized; a cycle in
//!   progress makes a concurrent invocation no-op

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod entitlement;
mod error;
mod orchestrator;
mod queue;
mod remote;
mod session;

pub use config::{EntitlementConfig, RetryConfig, SyncConfig};
pub use conflict::{ConflictResolver, Resolution, ResolutionStrategy};
pub use entitlement::{
    Denial, DenialCause, EntitlementGate, EntitlementProvider, EntitlementSnapshot,
    EntitlementStatus, MockEntitlementProvider,
};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{CycleOutcome, CycleSummary, SyncOrchestrator, SyncStats};
pub use queue::{
    ConsolidationReport, DocumentPatch, OperationKind, QueuedOperation, SyncQueue,
};
pub use remote::{ChangePage, MemoryRemoteAdapter, RemoteAdapter, RemoteChange};
pub use session::SyncSession;
