//! Per-repository synchronization cycle.
//!
//! [`RepositorySyncWorker::synchronize`] drives one repository through
//! fetch, parse, plan, verify, apply and persist. Every step can fail; any
//! failure ends the cycle with a `Failed` outcome and leaves the stored
//! state exactly as it was. Deltas are applied to a working copy of the
//! object map which is only committed once the whole range applied.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::document::{DeltaElement, DeltaRef, NotificationDocument};
use crate::error::{FailureReason, Result, SyncError};
use crate::fetch::{FetchClient, Fetched, TransportError};
use crate::hash::{self, ContentHash};
use crate::outcome::{CycleResult, SyncOutcome};
use crate::parser;
use crate::planner::{self, SnapshotReason, SyncPlan};
use crate::state::{apply_delta, RepositoryDescriptor, RepositoryState};
use crate::store::StateStore;
use crate::validate::{AcceptAll, ObjectValidator, ValidationResult};

/// Per-cycle knobs set by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore deltas and fetch the snapshot.
    pub force_snapshot: bool,
    /// Sent as `If-Modified-Since` on the notification request. This is the
    /// server's own `Last-Modified` from the notification the current state
    /// was synchronized against.
    pub if_modified_since: Option<DateTime<Utc>>,
}

/// Result of [`RepositorySyncWorker::synchronize`].
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// The newly committed state, present only when the cycle changed it.
    pub state: Option<RepositoryState>,
    /// `Last-Modified` of the notification the repository is now in sync
    /// with. Always `None` for a failed cycle.
    pub notification_modified: Option<DateTime<Utc>>,
}

/// What a successful cycle produced.
struct Cycle {
    result: CycleResult,
    state: Option<RepositoryState>,
    collisions: usize,
    rejected: usize,
    notification_modified: Option<DateTime<Utc>>,
}

impl Cycle {
    fn unchanged() -> Self {
        Self {
            result: CycleResult::NoChange,
            state: None,
            collisions: 0,
            rejected: 0,
            notification_modified: None,
        }
    }
}

/// Runs synchronization cycles against shared collaborators.
///
/// The worker itself is stateless; the scheduler guarantees that at most
/// one cycle per repository is in flight and passes in the current state.
#[derive(Clone)]
pub struct RepositorySyncWorker {
    fetcher: Arc<dyn FetchClient>,
    /// Clients for repositories that need their own transport settings.
    repository_fetchers: HashMap<String, Arc<dyn FetchClient>>,
    store: Arc<dyn StateStore>,
    validator: Arc<dyn ObjectValidator>,
}

impl RepositorySyncWorker {
    pub fn new(fetcher: Arc<dyn FetchClient>, store: Arc<dyn StateStore>) -> Self {
        Self {
            fetcher,
            repository_fetchers: HashMap::new(),
            store,
            validator: Arc::new(AcceptAll),
        }
    }

    /// Use `fetcher` instead of the shared client for repository `id`.
    pub fn with_repository_fetcher(
        mut self,
        id: impl Into<String>,
        fetcher: Arc<dyn FetchClient>,
    ) -> Self {
        self.repository_fetchers.insert(id.into(), fetcher);
        self
    }

    fn fetcher_for(&self, descriptor: &RepositoryDescriptor) -> &Arc<dyn FetchClient> {
        self.repository_fetchers
            .get(&descriptor.id)
            .unwrap_or(&self.fetcher)
    }

    pub fn with_validator(mut self, validator: Arc<dyn ObjectValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run one cycle for `descriptor`, starting from `current`.
    ///
    /// Never fails: errors are reported in the outcome.
    pub async fn synchronize(
        &self,
        descriptor: &RepositoryDescriptor,
        current: Option<&RepositoryState>,
        options: SyncOptions,
    ) -> SyncReport {
        let started = Instant::now();
        tracing::debug!(
            repository = %descriptor.id,
            serial = current.map(|s| s.serial),
            force_snapshot = options.force_snapshot,
            "starting synchronization cycle"
        );

        let result = self.run_cycle(descriptor, current, &options).await;
        let duration = started.elapsed();

        match result {
            Ok(cycle) => {
                let after = cycle.state.as_ref().or(current);
                tracing::info!(
                    repository = %descriptor.id,
                    result = %cycle.result,
                    session = after.map(|s| s.session_id.as_str()).unwrap_or(""),
                    serial = after.map(|s| s.serial),
                    duration_ms = duration.as_millis() as u64,
                    "synchronization cycle finished"
                );
                let outcome = SyncOutcome {
                    repository: descriptor.id.clone(),
                    result: cycle.result,
                    serial: after.map(|s| s.serial),
                    session_id: after.map(|s| s.session_id.clone()),
                    objects: after.map(|s| s.object_count()),
                    collisions: cycle.collisions,
                    rejected_objects: cycle.rejected,
                    timestamp: Utc::now(),
                    duration,
                };
                SyncReport {
                    outcome,
                    state: cycle.state,
                    notification_modified: cycle.notification_modified,
                }
            }
            Err(err) => {
                tracing::warn!(
                    repository = %descriptor.id,
                    kind = %err.kind(),
                    error = %err,
                    "synchronization cycle failed"
                );
                let mut outcome =
                    SyncOutcome::failed(descriptor.id.clone(), FailureReason::from(&err), duration);
                outcome.serial = current.map(|s| s.serial);
                outcome.session_id = current.map(|s| s.session_id.clone());
                outcome.objects = current.map(|s| s.object_count());
                SyncReport {
                    outcome,
                    state: None,
                    notification_modified: None,
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        descriptor: &RepositoryDescriptor,
        current: Option<&RepositoryState>,
        options: &SyncOptions,
    ) -> Result<Cycle> {
        let url = descriptor.notification_url.as_str();
        let since = if options.force_snapshot {
            None
        } else {
            current.and(options.if_modified_since)
        };
        let (body, modified) = match self.fetch(descriptor, url, since).await? {
            Fetched::Body {
                body,
                last_modified,
            } => (body, last_modified),
            Fetched::NotModified if since.is_some() => {
                tracing::debug!(repository = %descriptor.id, "notification not modified");
                let mut cycle = Cycle::unchanged();
                cycle.notification_modified = since;
                return Ok(cycle);
            }
            Fetched::NotModified => (self.fetch_body(descriptor, url).await?, None),
        };

        let notification =
            parser::parse_notification(&body).map_err(|e| SyncError::parse(url, e))?;
        if descriptor.strict_session_id {
            check_session_id(&notification.session_id)?;
        }

        let plan = planner::plan(current, &notification, options.force_snapshot)?;
        let mut cycle = match (plan, current) {
            (SyncPlan::NoChange, _) => Ok(Cycle::unchanged()),
            (SyncPlan::ApplyDeltas(deltas), Some(current)) => {
                self.apply_deltas(descriptor, current, &notification, &deltas)
                    .await
            }
            (SyncPlan::ApplyDeltas(_), None) => {
                self.fetch_snapshot(descriptor, &notification, SnapshotReason::NoPriorState)
                    .await
            }
            (SyncPlan::FetchSnapshot(reason), _) => {
                self.fetch_snapshot(descriptor, &notification, reason).await
            }
        }?;
        cycle.notification_modified = modified;
        Ok(cycle)
    }

    async fn apply_deltas(
        &self,
        descriptor: &RepositoryDescriptor,
        current: &RepositoryState,
        notification: &NotificationDocument,
        deltas: &[DeltaRef],
    ) -> Result<Cycle> {
        let mut working: BTreeMap<String, ContentHash> = current.objects.clone();
        let mut rejected = 0;

        for delta_ref in deltas {
            let url = descriptor.rewrite_uri(&delta_ref.uri);
            let body = self.fetch_body(descriptor, &url).await?;
            verify_hash(&url, &body, &delta_ref.hash)?;

            let delta = parser::parse_delta(&body).map_err(|e| SyncError::parse(&url, e))?;
            check_document(
                &url,
                (delta.session_id.as_str(), delta.serial),
                (notification.session_id.as_str(), delta_ref.serial),
            )?;

            let stats = apply_delta(&mut working, &delta)?;
            tracing::debug!(
                repository = %descriptor.id,
                serial = delta.serial,
                published = stats.published,
                replaced = stats.replaced,
                withdrawn = stats.withdrawn,
                "delta applied to working copy"
            );

            for element in &delta.elements {
                if let DeltaElement::Publish { uri, content, .. } = element {
                    rejected += self.check_object(descriptor, uri, content);
                }
            }
        }

        let state = current.advanced(notification, working);
        self.store.store(&descriptor.id, &state).await?;

        Ok(Cycle {
            result: CycleResult::DeltasApplied(deltas.len()),
            state: Some(state),
            collisions: 0,
            rejected,
            notification_modified: None,
        })
    }

    async fn fetch_snapshot(
        &self,
        descriptor: &RepositoryDescriptor,
        notification: &NotificationDocument,
        reason: SnapshotReason,
    ) -> Result<Cycle> {
        tracing::info!(
            repository = %descriptor.id,
            session = %notification.session_id,
            serial = notification.serial,
            %reason,
            "fetching snapshot"
        );

        let url = descriptor.rewrite_uri(&notification.snapshot.uri);
        let body = self.fetch_body(descriptor, &url).await?;
        verify_hash(&url, &body, &notification.snapshot.hash)?;

        let snapshot = parser::parse_snapshot(&body).map_err(|e| SyncError::parse(&url, e))?;
        check_document(
            &url,
            (snapshot.session_id.as_str(), snapshot.serial),
            (notification.session_id.as_str(), notification.serial),
        )?;

        let (state, collisions) = RepositoryState::from_snapshot(notification, &snapshot);
        let mut rejected = 0;
        let mut admitted = HashSet::with_capacity(snapshot.published.len());
        for object in &snapshot.published {
            // Dropped duplicates are not admitted, so they are not validated.
            if admitted.insert(object.uri.as_str()) {
                rejected += self.check_object(descriptor, &object.uri, &object.content);
            }
        }

        self.store.store(&descriptor.id, &state).await?;

        Ok(Cycle {
            result: CycleResult::SnapshotFetched,
            state: Some(state),
            collisions,
            rejected,
            notification_modified: None,
        })
    }

    /// Returns 1 if the validator rejected the object.
    fn check_object(&self, descriptor: &RepositoryDescriptor, uri: &str, content: &[u8]) -> usize {
        match self.validator.validate(uri, content) {
            ValidationResult::Valid => 0,
            ValidationResult::Invalid(reason) => {
                tracing::warn!(repository = %descriptor.id, uri, %reason, "object rejected");
                1
            }
        }
    }

    async fn fetch(
        &self,
        descriptor: &RepositoryDescriptor,
        url: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Fetched> {
        match tokio::time::timeout(
            descriptor.fetch_timeout,
            self.fetcher_for(descriptor).fetch(url, if_modified_since),
        )
        .await
        {
            Ok(fetched) => Ok(fetched?),
            Err(_) => Err(SyncError::Timeout(format!(
                "fetching {} exceeded {:?}",
                url, descriptor.fetch_timeout
            ))),
        }
    }

    async fn fetch_body(&self, descriptor: &RepositoryDescriptor, url: &str) -> Result<Bytes> {
        match self.fetch(descriptor, url, None).await? {
            Fetched::Body { body, .. } => Ok(body),
            Fetched::NotModified => Err(TransportError::connection(
                url,
                "unexpected 304 Not Modified without a conditional request",
            )
            .into()),
        }
    }
}

fn verify_hash(url: &str, body: &[u8], expected: &ContentHash) -> Result<()> {
    if hash::verify(body, expected) {
        Ok(())
    } else {
        Err(SyncError::HashMismatch {
            url: url.to_string(),
            expected: *expected,
            actual: ContentHash::of(body),
        })
    }
}

/// A fetched snapshot or delta must carry the session and serial the
/// notification advertised for it.
fn check_document(url: &str, found: (&str, u64), expected: (&str, u64)) -> Result<()> {
    if found.0 != expected.0 {
        return Err(SyncError::DocumentMismatch {
            url: url.to_string(),
            detail: format!("session_id {} does not match notification session_id {}", found.0, expected.0),
        });
    }
    if found.1 != expected.1 {
        return Err(SyncError::DocumentMismatch {
            url: url.to_string(),
            detail: format!("serial {} does not match expected serial {}", found.1, expected.1),
        });
    }
    Ok(())
}

fn check_session_id(session_id: &str) -> Result<()> {
    match uuid::Uuid::parse_str(session_id) {
        Ok(uuid) if uuid.get_version_num() == 4 => Ok(()),
        _ => Err(SyncError::InvalidNotification(format!(
            "session_id {:?} is not a version 4 UUID",
            session_id
        ))),
    }
}
