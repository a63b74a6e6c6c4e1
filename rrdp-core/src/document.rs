//! Typed RRDP documents.
//!
//! These are the decoded forms of the three document types a repository
//! publishes. They are ephemeral: fetched, checked and applied within a
//! single cycle, never persisted verbatim.

use crate::hash::ContentHash;

/// Location and digest of the snapshot advertised by a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub uri: String,
    pub hash: ContentHash,
}

/// Location and digest of one delta advertised by a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRef {
    pub serial: u64,
    pub uri: String,
    pub hash: ContentHash,
}

/// The entry-point document of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDocument {
    pub session_id: String,
    pub serial: u64,
    pub snapshot: SnapshotRef,
    /// Deltas in document order. Servers are free to list them in any order.
    pub deltas: Vec<DeltaRef>,
}

impl NotificationDocument {
    /// Look up the delta advertised for `serial`.
    pub fn delta(&self, serial: u64) -> Option<&DeltaRef> {
        self.deltas.iter().find(|d| d.serial == serial)
    }
}

/// One object in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedObject {
    pub uri: String,
    pub content: Vec<u8>,
}

/// Full enumeration of the published objects at one serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDocument {
    pub session_id: String,
    pub serial: u64,
    pub published: Vec<PublishedObject>,
}

/// A single change carried by a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaElement {
    /// Publish new content at `uri`. When `replaces` is set the URI must
    /// currently hold an object with that digest.
    Publish {
        uri: String,
        replaces: Option<ContentHash>,
        content: Vec<u8>,
    },
    /// Remove the object at `uri`, which must have digest `hash`.
    Withdraw { uri: String, hash: ContentHash },
}

impl DeltaElement {
    pub fn uri(&self) -> &str {
        match self {
            DeltaElement::Publish { uri, .. } | DeltaElement::Withdraw { uri, .. } => uri,
        }
    }
}

/// Changes that move a repository from `serial - 1` to `serial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaDocument {
    pub session_id: String,
    pub serial: u64,
    pub elements: Vec<DeltaElement>,
}
