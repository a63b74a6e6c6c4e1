//! Per-repository identity and synchronization state.
//!
//! A [`RepositoryDescriptor`] names a publication point and never changes.
//! A [`RepositoryState`] records what the last verified cycle established:
//! session, serial, the digest of every published object, and which
//! snapshot that corresponds to. It is replaced as a whole, never edited in
//! place by a cycle that might still fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::document::{DeltaDocument, DeltaElement, NotificationDocument, SnapshotDocument};
use crate::error::SyncError;
use crate::hash::ContentHash;

/// Default deadline for a single fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Immutable identity of a publication point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    /// Unique repository name, also used as the persistence key.
    pub id: String,
    pub notification_url: String,
    /// Trust anchor or operator this repository belongs to.
    pub trust_anchor: Option<String>,
    /// Host forced into snapshot and delta URIs before fetching them.
    pub override_hostname: Option<String>,
    pub fetch_timeout: Duration,
    /// Require RFC 4122 version 4 session ids.
    pub strict_session_id: bool,
    /// Host names this repository's fetches resolve to fixed addresses.
    pub connect_to: BTreeMap<String, SocketAddr>,
}

impl RepositoryDescriptor {
    pub fn new(id: impl Into<String>, notification_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            notification_url: notification_url.into(),
            trust_anchor: None,
            override_hostname: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            strict_session_id: false,
            connect_to: BTreeMap::new(),
        }
    }

    pub fn with_trust_anchor(mut self, trust_anchor: impl Into<String>) -> Self {
        self.trust_anchor = Some(trust_anchor.into());
        self
    }

    pub fn with_override_hostname(mut self, host: impl Into<String>) -> Self {
        self.override_hostname = Some(host.into());
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_strict_session_id(mut self, strict: bool) -> Self {
        self.strict_session_id = strict;
        self
    }

    pub fn with_connect_to(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.connect_to.insert(host.into(), addr);
        self
    }

    /// `host=addr` pairs of the address overrides, comma separated, or an
    /// empty string.
    pub fn connect_to_label(&self) -> String {
        self.connect_to
            .iter()
            .map(|(host, addr)| format!("{}={}", host, addr))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Apply the hostname override to a URI taken from a notification.
    /// URIs that cannot be parsed or rewritten are returned unchanged.
    pub fn rewrite_uri(&self, uri: &str) -> String {
        let Some(host) = self.override_hostname.as_deref() else {
            return uri.to_string();
        };
        match reqwest::Url::parse(uri) {
            Ok(mut url) => {
                if url.set_host(Some(host)).is_ok() {
                    url.to_string()
                } else {
                    uri.to_string()
                }
            }
            Err(_) => uri.to_string(),
        }
    }
}

/// Last verified state of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub session_id: String,
    pub serial: u64,
    /// Digest of every currently published object, keyed by URI.
    pub objects: BTreeMap<String, ContentHash>,
    pub snapshot_uri: String,
    pub snapshot_hash: ContentHash,
    /// When this state was committed.
    pub updated_at: DateTime<Utc>,
}

impl RepositoryState {
    /// Build a fresh state from a verified snapshot.
    ///
    /// When a URI is published more than once the first occurrence wins;
    /// the number of dropped duplicates is returned alongside.
    pub fn from_snapshot(
        notification: &NotificationDocument,
        snapshot: &SnapshotDocument,
    ) -> (Self, usize) {
        let mut objects = BTreeMap::new();
        let mut collisions = 0usize;
        for object in &snapshot.published {
            let hash = ContentHash::of(&object.content);
            match objects.get(&object.uri) {
                Some(existing) => {
                    collisions += 1;
                    tracing::warn!(
                        uri = %object.uri,
                        kept = %existing,
                        dropped = %hash,
                        "multiple objects published for one URI, keeping the first"
                    );
                }
                None => {
                    objects.insert(object.uri.clone(), hash);
                }
            }
        }

        let state = Self {
            session_id: notification.session_id.clone(),
            serial: notification.serial,
            objects,
            snapshot_uri: notification.snapshot.uri.clone(),
            snapshot_hash: notification.snapshot.hash,
            updated_at: Utc::now(),
        };
        (state, collisions)
    }

    /// The state reached after applying deltas up to `notification`'s serial
    /// to a working copy of the object map.
    pub fn advanced(
        &self,
        notification: &NotificationDocument,
        objects: BTreeMap<String, ContentHash>,
    ) -> Self {
        Self {
            session_id: self.session_id.clone(),
            serial: notification.serial,
            objects,
            snapshot_uri: notification.snapshot.uri.clone(),
            snapshot_hash: notification.snapshot.hash,
            updated_at: Utc::now(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Counts of the changes a delta made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub published: usize,
    pub replaced: usize,
    pub withdrawn: usize,
}

/// Apply one delta to a working copy of an object map.
///
/// A publish without `hash` must introduce a new URI; a publish with `hash`
/// and a withdraw must name a URI currently holding exactly that digest.
/// On error the map may be partially modified; callers work on a copy.
pub fn apply_delta(
    objects: &mut BTreeMap<String, ContentHash>,
    delta: &DeltaDocument,
) -> Result<DeltaStats, SyncError> {
    let conflict = |detail: String| SyncError::DeltaConflict {
        serial: delta.serial,
        detail,
    };

    let mut stats = DeltaStats::default();
    for element in &delta.elements {
        match element {
            DeltaElement::Publish {
                uri,
                replaces: None,
                content,
            } => {
                if objects.contains_key(uri) {
                    return Err(conflict(format!(
                        "publish of {} without hash, but the object already exists",
                        uri
                    )));
                }
                objects.insert(uri.clone(), ContentHash::of(content));
                stats.published += 1;
            }
            DeltaElement::Publish {
                uri,
                replaces: Some(expected),
                content,
            } => {
                check_current(objects, uri, expected).map_err(conflict)?;
                objects.insert(uri.clone(), ContentHash::of(content));
                stats.replaced += 1;
            }
            DeltaElement::Withdraw { uri, hash } => {
                check_current(objects, uri, hash).map_err(conflict)?;
                objects.remove(uri);
                stats.withdrawn += 1;
            }
        }
    }
    Ok(stats)
}

fn check_current(
    objects: &BTreeMap<String, ContentHash>,
    uri: &str,
    expected: &ContentHash,
) -> Result<(), String> {
    match objects.get(uri) {
        Some(current) if current == expected => Ok(()),
        Some(current) => Err(format!(
            "{} has hash {}, delta expects {}",
            uri, current, expected
        )),
        None => Err(format!("{} is not currently published", uri)),
    }
}
