//! RRDP Core Library
//!
//! Synchronization engine for RPKI Repository Delta Protocol (RFC 8182)
//! publication points:
//! - Notification, snapshot and delta parsing
//! - Update planning (deltas vs. snapshot) and hash verification
//! - All-or-nothing state updates with atomic persistence
//! - A scheduler running many repositories with per-repository exclusivity,
//!   a global concurrency ceiling and failure backoff
//! - Outcome reporting to metrics and an on-disk outcome log

pub mod backoff;
pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod outcome;
pub mod parser;
pub mod planner;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod validate;
pub mod worker;

pub use backoff::{BackoffPolicy, RepositoryBackoff};
pub use config::{Config, ConfigError, SchedulerConfig};
pub use document::{
    DeltaDocument, DeltaElement, DeltaRef, NotificationDocument, PublishedObject,
    SnapshotDocument, SnapshotRef,
};
pub use error::{FailureKind, FailureReason, Result, SyncError};
pub use fetch::{FetchClient, Fetched, HttpFetchClient, HttpFetchConfig, MemoryFetchClient, TransportError};
pub use hash::ContentHash;
pub use outcome::{
    CycleResult, MemoryOutcomeSink, MetricsRecorder, NoopSink, OutcomeLog, OutcomeSink,
    OutcomeSinks, SyncOutcome,
};
pub use parser::{parse_delta, parse_notification, parse_snapshot, ParseError};
pub use planner::{plan, PlanError, SnapshotReason, SyncPlan};
pub use scheduler::{RepositoryStatus, SlotStatus, SyncScheduler, TriggerResult};
pub use state::{apply_delta, DeltaStats, RepositoryDescriptor, RepositoryState};
pub use store::{FileStateStore, MemoryStateStore, StateStore, StoreError};
pub use validate::{AcceptAll, ExtensionFilter, ObjectValidator, ValidationResult};
pub use worker::{RepositorySyncWorker, SyncOptions, SyncReport};
