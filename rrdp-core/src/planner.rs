//! Update strategy for one cycle.
//!
//! Given the current state (if any) and a freshly parsed notification,
//! [`plan`] decides whether nothing needs fetching, a contiguous run of
//! deltas can be applied, or the snapshot must be fetched. It is a pure
//! function; the worker carries out whatever it returns.

use std::collections::HashMap;

use crate::document::{DeltaRef, NotificationDocument};
use crate::state::RepositoryState;

/// What a cycle has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    /// `(session, serial)` is unchanged.
    NoChange,
    /// Apply these deltas, in this (ascending) order.
    ApplyDeltas(Vec<DeltaRef>),
    /// Replace the whole object set from the snapshot.
    FetchSnapshot(SnapshotReason),
}

/// Why a snapshot is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    NoPriorState,
    SessionChanged,
    /// The delta for `missing` is not advertised.
    DeltasUnavailable { missing: u64 },
    /// The local state is known to be unusable for delta application.
    Forced,
}

impl std::fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotReason::NoPriorState => write!(f, "no prior state"),
            SnapshotReason::SessionChanged => write!(f, "session changed"),
            SnapshotReason::DeltasUnavailable { missing } => {
                write!(f, "delta for serial {} unavailable", missing)
            }
            SnapshotReason::Forced => write!(f, "forced"),
        }
    }
}

/// Protocol violations detected while planning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    #[error("notification serial {notified} is below current serial {current}")]
    NotificationRegressed { current: u64, notified: u64 },
}

/// Decide how to bring `current` up to `notification`.
///
/// `force_snapshot` is set after a cycle found the local state inconsistent
/// with a delta; it turns every outcome except an error into a snapshot
/// fetch.
pub fn plan(
    current: Option<&RepositoryState>,
    notification: &NotificationDocument,
    force_snapshot: bool,
) -> Result<SyncPlan, PlanError> {
    validate(notification)?;

    let Some(current) = current else {
        return Ok(SyncPlan::FetchSnapshot(SnapshotReason::NoPriorState));
    };

    if current.session_id != notification.session_id {
        return Ok(SyncPlan::FetchSnapshot(SnapshotReason::SessionChanged));
    }

    if notification.serial < current.serial {
        return Err(PlanError::NotificationRegressed {
            current: current.serial,
            notified: notification.serial,
        });
    }

    if force_snapshot {
        return Ok(SyncPlan::FetchSnapshot(SnapshotReason::Forced));
    }

    if notification.serial == current.serial {
        report_snapshot_inconsistency(current, notification);
        return Ok(SyncPlan::NoChange);
    }

    let by_serial: HashMap<u64, &DeltaRef> =
        notification.deltas.iter().map(|d| (d.serial, d)).collect();

    // A range wider than the advertised list cannot be complete, so the
    // loop below stops after at most `deltas.len() + 1` steps.
    let mut apply = Vec::with_capacity(notification.deltas.len());
    for serial in current.serial + 1..=notification.serial {
        match by_serial.get(&serial) {
            Some(delta) => apply.push((*delta).clone()),
            None => {
                return Ok(SyncPlan::FetchSnapshot(SnapshotReason::DeltasUnavailable {
                    missing: serial,
                }));
            }
        }
    }
    Ok(SyncPlan::ApplyDeltas(apply))
}

fn validate(notification: &NotificationDocument) -> Result<(), PlanError> {
    if notification.session_id.trim().is_empty() {
        return Err(PlanError::InvalidNotification("empty session_id".to_string()));
    }
    if notification.snapshot.uri.trim().is_empty() {
        return Err(PlanError::InvalidNotification("empty snapshot uri".to_string()));
    }

    let mut seen = std::collections::HashSet::with_capacity(notification.deltas.len());
    for delta in &notification.deltas {
        if delta.serial == 0 {
            return Err(PlanError::InvalidNotification(
                "delta with serial 0".to_string(),
            ));
        }
        if delta.serial > notification.serial {
            return Err(PlanError::InvalidNotification(format!(
                "delta serial {} exceeds notification serial {}",
                delta.serial, notification.serial
            )));
        }
        if !seen.insert(delta.serial) {
            return Err(PlanError::InvalidNotification(format!(
                "duplicate delta serial {}",
                delta.serial
            )));
        }
        if delta.uri.trim().is_empty() {
            return Err(PlanError::InvalidNotification(format!(
                "empty uri for delta {}",
                delta.serial
            )));
        }
    }
    Ok(())
}

/// At an unchanged serial the snapshot reference should be unchanged too.
fn report_snapshot_inconsistency(current: &RepositoryState, notification: &NotificationDocument) {
    let same_uri = current.snapshot_uri == notification.snapshot.uri;
    let same_hash = current.snapshot_hash == notification.snapshot.hash;
    if same_hash && !same_uri {
        tracing::error!(
            hash = %notification.snapshot.hash,
            current = %notification.snapshot.uri,
            previous = %current.snapshot_uri,
            "RRDP inconsistency: snapshot hash unchanged but uri differs"
        );
    } else if same_uri && !same_hash {
        tracing::error!(
            uri = %notification.snapshot.uri,
            current = %notification.snapshot.hash,
            previous = %current.snapshot_hash,
            "RRDP inconsistency: snapshot uri unchanged but hash differs"
        );
    }
}
