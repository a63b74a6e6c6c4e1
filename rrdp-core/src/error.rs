//! Error taxonomy for a synchronization cycle.
//!
//! Every error raised while synchronizing one repository is a [`SyncError`].
//! The worker converts it into a [`FailureReason`] carried by the cycle's
//! outcome; none of them escape to the scheduler.

use serde::{Deserialize, Serialize};

use crate::fetch::TransportError;
use crate::hash::ContentHash;
use crate::parser::ParseError;
use crate::planner::PlanError;
use crate::store::StoreError;

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that abort a synchronization cycle
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] TransportError),

    #[error("Parse error in {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },

    #[error("Invalid notification: {0}")]
    InvalidNotification(String),

    #[error("Notification serial regressed from {current} to {notified}")]
    NotificationRegressed { current: u64, notified: u64 },

    #[error("Hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Document mismatch in {url}: {detail}")]
    DocumentMismatch { url: String, detail: String },

    #[error("Delta {serial} cannot be applied: {detail}")]
    DeltaConflict { serial: u64, detail: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl SyncError {
    pub fn parse(url: impl Into<String>, source: ParseError) -> Self {
        Self::Parse {
            url: url.into(),
            source,
        }
    }

    /// Classify this error for outcomes, metrics and backoff.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Fetch(e) if e.is_timeout() => FailureKind::Timeout,
            SyncError::Fetch(_) => FailureKind::FetchError,
            SyncError::Parse { .. } => FailureKind::ParseError,
            SyncError::InvalidNotification(_) => FailureKind::InvalidNotification,
            SyncError::NotificationRegressed { .. } => FailureKind::NotificationRegressed,
            SyncError::HashMismatch { .. } => FailureKind::HashMismatch,
            SyncError::DocumentMismatch { .. } => FailureKind::DocumentMismatch,
            SyncError::DeltaConflict { .. } => FailureKind::DeltaConflict,
            SyncError::Timeout(_) => FailureKind::Timeout,
            SyncError::Persistence(_) => FailureKind::PersistenceError,
        }
    }
}

impl From<PlanError> for SyncError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InvalidNotification(detail) => SyncError::InvalidNotification(detail),
            PlanError::NotificationRegressed { current, notified } => {
                SyncError::NotificationRegressed { current, notified }
            }
        }
    }
}

/// Coarse classification of a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FetchError,
    ParseError,
    InvalidNotification,
    NotificationRegressed,
    HashMismatch,
    DocumentMismatch,
    DeltaConflict,
    Timeout,
    PersistenceError,
    /// The cycle panicked.
    Internal,
}

impl FailureKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FetchError => "fetch_error",
            FailureKind::ParseError => "parse_error",
            FailureKind::InvalidNotification => "invalid_notification",
            FailureKind::NotificationRegressed => "notification_regressed",
            FailureKind::HashMismatch => "hash_mismatch",
            FailureKind::DocumentMismatch => "document_mismatch",
            FailureKind::DeltaConflict => "delta_conflict",
            FailureKind::Timeout => "timeout",
            FailureKind::PersistenceError => "persistence_error",
            FailureKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cycle failed, as reported in its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SyncError> for FailureReason {
    fn from(err: &SyncError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_timeout_classified_as_timeout() {
        let err = SyncError::from(TransportError::timeout("https://host/n.xml", "deadline"));
        assert_eq!(err.kind(), FailureKind::Timeout);

        let err = SyncError::from(TransportError::status("https://host/n.xml", 503));
        assert_eq!(err.kind(), FailureKind::FetchError);
    }

    #[test]
    fn test_plan_error_conversion() {
        let err = SyncError::from(PlanError::NotificationRegressed {
            current: 10,
            notified: 9,
        });
        assert_eq!(err.kind(), FailureKind::NotificationRegressed);
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("9"));
    }

    #[test]
    fn test_failure_reason_from_error() {
        let err = SyncError::DeltaConflict {
            serial: 12,
            detail: "withdraw of unknown object".to_string(),
        };
        let reason = FailureReason::from(&err);
        assert_eq!(reason.kind, FailureKind::DeltaConflict);
        assert_eq!(reason.kind.as_str(), "delta_conflict");
        assert!(reason.message.contains("withdraw"));
    }
}
