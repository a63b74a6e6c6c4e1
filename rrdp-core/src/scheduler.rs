//! Cadence and concurrency control across repositories.
//!
//! The scheduler owns one slot per repository. A slot is either `Idle` or
//! `Running`; it is flipped to `Running` under the slots mutex before a
//! cycle is spawned and back to `Idle` by a drop guard, so a repository
//! never has two cycles in flight and a panicking or timed-out cycle still
//! releases it. A semaphore bounds the number of cycles that run at once.
//!
//! Backoff, the cached [`RepositoryState`] and the force-snapshot flag live
//! in the slot and are only touched when a cycle starts or finishes.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffPolicy, RepositoryBackoff};
use crate::config::{ConfigError, SchedulerConfig};
use crate::error::{FailureKind, FailureReason};
use crate::fetch::lock;
use crate::outcome::{OutcomeSink, SyncOutcome};
use crate::state::{RepositoryDescriptor, RepositoryState};
use crate::store::is_valid_id;
use crate::worker::{RepositorySyncWorker, SyncOptions, SyncReport};

/// Whether a repository has a cycle in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Running,
}

/// Result of asking for a cycle.
#[derive(Debug)]
pub enum TriggerResult {
    /// A cycle was spawned; the handle resolves to its outcome.
    Dispatched(JoinHandle<SyncOutcome>),
    /// A cycle is already in flight; nothing was queued.
    AlreadyRunning,
    UnknownRepository,
}

impl TriggerResult {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, TriggerResult::Dispatched(_))
    }
}

/// Read-only view of one slot.
#[derive(Debug, Clone)]
pub struct RepositoryStatus {
    pub id: String,
    pub status: SlotStatus,
    pub session_id: Option<String>,
    pub serial: Option<u64>,
    pub consecutive_failures: u32,
    pub current_delay: Duration,
    /// Time until the next cycle is due (zero when overdue).
    pub next_due_in: Duration,
    pub force_snapshot: bool,
    /// Overdue ticks skipped because a cycle was still running.
    pub skipped_ticks: u64,
    pub last_success: Option<DateTime<Utc>>,
    /// Server `Last-Modified` of the notification the cached state matches.
    pub notification_modified: Option<DateTime<Utc>>,
    pub last_outcome: Option<SyncOutcome>,
}

struct Slot {
    descriptor: Arc<RepositoryDescriptor>,
    status: SlotStatus,
    backoff: RepositoryBackoff,
    /// `None` with `state_loaded` means the repository has never synced.
    state: Option<RepositoryState>,
    state_loaded: bool,
    force_snapshot: bool,
    next_due: Instant,
    skipped_ticks: u64,
    last_success: Option<DateTime<Utc>>,
    notification_modified: Option<DateTime<Utc>>,
    last_outcome: Option<SyncOutcome>,
}

impl Slot {
    fn new(descriptor: RepositoryDescriptor, policy: &BackoffPolicy) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            status: SlotStatus::Idle,
            backoff: RepositoryBackoff::new(policy),
            state: None,
            state_loaded: false,
            force_snapshot: false,
            next_due: Instant::now(),
            skipped_ticks: 0,
            last_success: None,
            notification_modified: None,
            last_outcome: None,
        }
    }
}

/// Everything a spawned cycle needs, taken from the slot when it starts.
struct CycleInput {
    descriptor: Arc<RepositoryDescriptor>,
    /// `None` when the state still has to be loaded from the store.
    state: Option<Option<RepositoryState>>,
    options: SyncOptions,
}

struct Inner {
    config: SchedulerConfig,
    policy: BackoffPolicy,
    worker: RepositorySyncWorker,
    sink: Arc<dyn OutcomeSink>,
    permits: Arc<Semaphore>,
    slots: Mutex<BTreeMap<String, Slot>>,
}

/// Runs [`RepositorySyncWorker`] cycles for a set of repositories.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        worker: RepositorySyncWorker,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        let policy = config.backoff_policy();
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                worker,
                sink,
                permits,
                slots: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a repository. Its first cycle is due immediately.
    pub fn add_repository(&self, descriptor: RepositoryDescriptor) -> Result<(), ConfigError> {
        if !is_valid_id(&descriptor.id) {
            return Err(ConfigError::Invalid(format!(
                "invalid repository name {:?}",
                descriptor.id
            )));
        }
        let mut slots = lock(&self.inner.slots);
        if slots.contains_key(&descriptor.id) {
            return Err(ConfigError::Invalid(format!(
                "repository {:?} already registered",
                descriptor.id
            )));
        }
        tracing::debug!(repository = %descriptor.id, url = %descriptor.notification_url, "repository registered");
        slots.insert(
            descriptor.id.clone(),
            Slot::new(descriptor, &self.inner.policy),
        );
        Ok(())
    }

    pub fn repository_ids(&self) -> Vec<String> {
        lock(&self.inner.slots).keys().cloned().collect()
    }

    /// Start a cycle for `id` now, regardless of its cadence.
    pub fn trigger(&self, id: &str) -> TriggerResult {
        let input = {
            let mut slots = lock(&self.inner.slots);
            let Some(slot) = slots.get_mut(id) else {
                return TriggerResult::UnknownRepository;
            };
            if slot.status == SlotStatus::Running {
                slot.skipped_ticks += 1;
                tracing::debug!(repository = %id, "cycle still running, skipping");
                return TriggerResult::AlreadyRunning;
            }
            start(slot)
        };
        TriggerResult::Dispatched(self.spawn_cycle(id.to_string(), input))
    }

    /// Start a cycle for every idle repository whose next attempt is due.
    ///
    /// Overdue repositories that are still running are skipped, not queued.
    pub fn dispatch_due(&self, now: Instant) -> Vec<JoinHandle<SyncOutcome>> {
        let mut starting = Vec::new();
        {
            let mut slots = lock(&self.inner.slots);
            for (id, slot) in slots.iter_mut() {
                if slot.next_due > now {
                    continue;
                }
                match slot.status {
                    SlotStatus::Running => {
                        slot.skipped_ticks += 1;
                        tracing::debug!(
                            repository = %id,
                            skipped = slot.skipped_ticks,
                            "overdue tick skipped, previous cycle still running"
                        );
                    }
                    SlotStatus::Idle => starting.push((id.clone(), start(slot))),
                }
            }
        }

        starting
            .into_iter()
            .map(|(id, input)| self.spawn_cycle(id, input))
            .collect()
    }

    /// Run one cycle for every idle repository and wait for all of them.
    pub async fn run_once(&self) -> Vec<SyncOutcome> {
        let handles: Vec<_> = self
            .repository_ids()
            .iter()
            .filter_map(|id| match self.trigger(id) {
                TriggerResult::Dispatched(handle) => Some(handle),
                _ => None,
            })
            .collect();
        collect_outcomes(handles).await
    }

    /// Dispatch due cycles every tick until `shutdown` is cancelled, then
    /// wait for the cycles still in flight.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<SyncOutcome>> = Vec::new();

        tracing::info!(
            repositories = lock(&self.inner.slots).len(),
            max_concurrency = self.inner.config.max_concurrency,
            interval_secs = self.inner.config.interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.extend(self.dispatch_due(Instant::now()));
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "scheduler stopping, waiting for running cycles");
        collect_outcomes(in_flight).await;
        tracing::info!("scheduler stopped");
    }

    /// Status of every repository, ordered by id.
    pub fn snapshot(&self) -> Vec<RepositoryStatus> {
        let now = Instant::now();
        lock(&self.inner.slots)
            .iter()
            .map(|(id, slot)| RepositoryStatus {
                id: id.clone(),
                status: slot.status,
                session_id: slot.state.as_ref().map(|s| s.session_id.clone()),
                serial: slot.state.as_ref().map(|s| s.serial),
                consecutive_failures: slot.backoff.consecutive_failures,
                current_delay: slot.backoff.current_delay,
                next_due_in: slot.next_due.saturating_duration_since(now),
                force_snapshot: slot.force_snapshot,
                skipped_ticks: slot.skipped_ticks,
                last_success: slot.last_success,
                notification_modified: slot.notification_modified,
                last_outcome: slot.last_outcome.clone(),
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<RepositoryStatus> {
        self.snapshot().into_iter().find(|s| s.id == id)
    }

    fn spawn_cycle(&self, id: String, input: CycleInput) -> JoinHandle<SyncOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut guard = SlotGuard {
                inner: inner.clone(),
                id: id.clone(),
                completed: false,
            };

            // The semaphore is never closed.
            let _permit = inner.permits.clone().acquire_owned().await.ok();
            let started = std::time::Instant::now();

            let result = AssertUnwindSafe(run_cycle(&inner, input)).catch_unwind().await;
            let done = match result {
                Ok(done) => done,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(repository = %id, panic = %message, "synchronization cycle panicked");
                    let reason = FailureReason::new(FailureKind::Internal, message);
                    CycleDone::reload(SyncOutcome::failed(id.clone(), reason, started.elapsed()))
                }
            };

            inner.sink.record(&done.outcome);
            guard.complete(done)
        })
    }
}

/// Flip an idle slot to running and take what the cycle needs.
fn start(slot: &mut Slot) -> CycleInput {
    slot.status = SlotStatus::Running;
    let state = if slot.state_loaded {
        Some(slot.state.take())
    } else {
        None
    };
    CycleInput {
        descriptor: slot.descriptor.clone(),
        state,
        options: SyncOptions {
            force_snapshot: slot.force_snapshot,
            if_modified_since: slot.notification_modified,
        },
    }
}

/// What a finished cycle hands back to its slot.
struct CycleDone {
    outcome: SyncOutcome,
    /// The state to cache, or `None` when the slot must reload it from the
    /// store.
    state: Option<Option<RepositoryState>>,
    notification_modified: Option<DateTime<Utc>>,
}

impl CycleDone {
    fn reload(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            state: None,
            notification_modified: None,
        }
    }
}

/// Deadlines too far out to represent are pushed to a distant instant.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn due_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn run_cycle(inner: &Inner, input: CycleInput) -> CycleDone {
    let started = std::time::Instant::now();
    let descriptor = input.descriptor;

    let current = match input.state {
        Some(state) => state,
        None => match inner.worker.store().load(&descriptor.id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(repository = %descriptor.id, error = %e, "failed to load repository state");
                let reason = FailureReason::new(
                    FailureKind::PersistenceError,
                    format!("Persistence error: {}", e),
                );
                return CycleDone::reload(SyncOutcome::failed(
                    descriptor.id.clone(),
                    reason,
                    started.elapsed(),
                ));
            }
        },
    };

    let timeout = inner.config.cycle_timeout;
    let cycle = inner
        .worker
        .synchronize(&descriptor, current.as_ref(), input.options);
    match tokio::time::timeout(timeout, cycle).await {
        Ok(SyncReport {
            outcome,
            state,
            notification_modified,
        }) => {
            let cached = match state {
                Some(new_state) => Some(new_state),
                None => current,
            };
            CycleDone {
                outcome,
                state: Some(cached),
                notification_modified,
            }
        }
        Err(_) => {
            tracing::warn!(repository = %descriptor.id, timeout_secs = timeout.as_secs(), "synchronization cycle timed out");
            let reason = FailureReason::new(
                FailureKind::Timeout,
                format!("cycle exceeded {:?}", timeout),
            );
            let mut outcome = SyncOutcome::failed(descriptor.id.clone(), reason, started.elapsed());
            outcome.serial = current.as_ref().map(|s| s.serial);
            outcome.session_id = current.as_ref().map(|s| s.session_id.clone());
            // The cycle may have been cut off after storing new state.
            CycleDone::reload(outcome)
        }
    }
}

/// Returns its slot to `Idle` on every exit path.
struct SlotGuard {
    inner: Arc<Inner>,
    id: String,
    completed: bool,
}

impl SlotGuard {
    fn complete(&mut self, done: CycleDone) -> SyncOutcome {
        let CycleDone {
            outcome,
            state,
            notification_modified,
        } = done;
        let mut slots = lock(&self.inner.slots);
        if let Some(slot) = slots.get_mut(&self.id) {
            let delay = slot.backoff.on_outcome(&outcome.result, &self.inner.policy);
            slot.next_due = due_after(delay);
            slot.status = SlotStatus::Idle;
            slot.last_outcome = Some(outcome.clone());

            match outcome.result.failure_kind() {
                None => {
                    slot.force_snapshot = false;
                    slot.last_success = Some(outcome.timestamp);
                    slot.notification_modified = notification_modified;
                }
                Some(FailureKind::DeltaConflict) => {
                    tracing::info!(repository = %self.id, "local state conflicts with a delta, next cycle fetches the snapshot");
                    slot.force_snapshot = true;
                }
                Some(_) => {}
            }

            match state {
                Some(state) => {
                    slot.state = state;
                    slot.state_loaded = true;
                }
                None => {
                    slot.state = None;
                    slot.state_loaded = false;
                }
            }

            if !outcome.is_success() {
                tracing::debug!(
                    repository = %self.id,
                    failures = slot.backoff.consecutive_failures,
                    next_attempt_secs = delay.as_secs(),
                    "backing off"
                );
            }
        }
        self.completed = true;
        outcome
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // The task was aborted; release the slot and reload state next time.
        let mut slots = lock(&self.inner.slots);
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.status = SlotStatus::Idle;
            slot.state = None;
            slot.state_loaded = false;
            slot.next_due = due_after(slot.backoff.current_delay);
        }
    }
}

async fn collect_outcomes(handles: Vec<JoinHandle<SyncOutcome>>) -> Vec<SyncOutcome> {
    futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "synchronization task failed to join");
                None
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
