//! Cycle outcomes and where they go.
//!
//! Every call to the worker produces exactly one [`SyncOutcome`]. The
//! scheduler hands it to an [`OutcomeSink`]; the sinks here publish metrics
//! ([`MetricsRecorder`]), keep a per-repository history on disk
//! ([`OutcomeLog`]) or collect in memory ([`MemoryOutcomeSink`]).

use chrono::{DateTime, Utc};
use metrics::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FailureKind, FailureReason};
use crate::fetch::lock;
use crate::state::RepositoryDescriptor;
use crate::store::{is_valid_id, StoreError};

/// Result of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleResult {
    NoChange,
    /// Number of deltas applied
    DeltasApplied(usize),
    SnapshotFetched,
    Failed(FailureReason),
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, CycleResult::Failed(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            CycleResult::Failed(reason) => Some(reason.kind),
            _ => None,
        }
    }

    /// Metric/log label: `no_change`, `deltas_applied`, `snapshot_fetched`
    /// or the failure kind.
    pub fn status(&self) -> &'static str {
        match self {
            CycleResult::NoChange => "no_change",
            CycleResult::DeltasApplied(_) => "deltas_applied",
            CycleResult::SnapshotFetched => "snapshot_fetched",
            CycleResult::Failed(reason) => reason.kind.as_str(),
        }
    }
}

impl std::fmt::Display for CycleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleResult::NoChange => write!(f, "no change"),
            CycleResult::DeltasApplied(n) => write!(f, "{} deltas applied", n),
            CycleResult::SnapshotFetched => write!(f, "snapshot fetched"),
            CycleResult::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// What one cycle did for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub repository: String,
    pub result: CycleResult,
    /// Serial the repository is at after the cycle, if known.
    pub serial: Option<u64>,
    pub session_id: Option<String>,
    /// Number of objects held after the cycle, if known.
    #[serde(default)]
    pub objects: Option<usize>,
    /// Duplicate URIs dropped from a snapshot.
    #[serde(default)]
    pub collisions: usize,
    /// Objects the validator rejected.
    #[serde(default)]
    pub rejected_objects: usize,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

impl SyncOutcome {
    /// A failed outcome for a cycle that could not get far enough to know
    /// anything about the repository.
    pub fn failed(repository: impl Into<String>, reason: FailureReason, duration: Duration) -> Self {
        Self {
            repository: repository.into(),
            result: CycleResult::Failed(reason),
            serial: None,
            session_id: None,
            objects: None,
            collisions: 0,
            rejected_objects: 0,
            timestamp: Utc::now(),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Receives one outcome per cycle.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: &SyncOutcome);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl OutcomeSink for NoopSink {
    fn record(&self, _outcome: &SyncOutcome) {}
}

/// Fan-out to several sinks in order
#[derive(Default, Clone)]
pub struct OutcomeSinks {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl OutcomeSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl OutcomeSink for OutcomeSinks {
    fn record(&self, outcome: &SyncOutcome) {
        for sink in &self.sinks {
            sink.record(outcome);
        }
    }
}

/// Publishes outcomes through the `metrics` facade.
///
/// Every series carries `repository` and `connect_to` labels; `connect_to`
/// holds the repository's address overrides as `host=addr` pairs, or is
/// empty. Whatever recorder the application installed receives:
/// - `rrdp_sync_cycles_total{status}` counter
/// - `rrdp_sync_duration_seconds` histogram
/// - `rrdp_repository_serial` gauge
/// - `rrdp_repository_objects` gauge
/// - `rrdp_snapshot_uri_collisions` gauge (snapshots only)
#[derive(Debug, Default, Clone)]
pub struct MetricsRecorder {
    connect_to: BTreeMap<String, String>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository so its series carry its address overrides.
    pub fn with_repository(mut self, descriptor: &RepositoryDescriptor) -> Self {
        self.connect_to
            .insert(descriptor.id.clone(), descriptor.connect_to_label());
        self
    }

    fn labels(&self, repository: &str) -> Vec<Label> {
        let connect_to = self.connect_to.get(repository).cloned().unwrap_or_default();
        vec![
            Label::new("repository", repository.to_string()),
            Label::new("connect_to", connect_to),
        ]
    }
}

impl OutcomeSink for MetricsRecorder {
    fn record(&self, outcome: &SyncOutcome) {
        let labels = self.labels(&outcome.repository);

        let mut cycle_labels = labels.clone();
        cycle_labels.push(Label::new("status", outcome.result.status()));
        metrics::counter!("rrdp_sync_cycles_total", cycle_labels).increment(1);
        metrics::histogram!("rrdp_sync_duration_seconds", labels.clone())
            .record(outcome.duration.as_secs_f64());

        if !outcome.is_success() {
            return;
        }
        if let Some(serial) = outcome.serial {
            metrics::gauge!("rrdp_repository_serial", labels.clone()).set(serial as f64);
        }
        if let Some(count) = outcome.objects {
            metrics::gauge!("rrdp_repository_objects", labels.clone()).set(count as f64);
        }
        if outcome.result == CycleResult::SnapshotFetched {
            metrics::gauge!("rrdp_snapshot_uri_collisions", labels)
                .set(outcome.collisions as f64);
        }
    }
}

/// Collects outcomes in memory.
#[derive(Debug, Default)]
pub struct MemoryOutcomeSink {
    outcomes: Mutex<Vec<SyncOutcome>>,
}

impl MemoryOutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<SyncOutcome> {
        lock(&self.outcomes).clone()
    }

    pub fn for_repository(&self, repository: &str) -> Vec<SyncOutcome> {
        lock(&self.outcomes)
            .iter()
            .filter(|o| o.repository == repository)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.outcomes).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.outcomes).is_empty()
    }
}

impl OutcomeSink for MemoryOutcomeSink {
    fn record(&self, outcome: &SyncOutcome) {
        lock(&self.outcomes).push(outcome.clone());
    }
}

/// Append-only outcome history, one JSON-lines file per repository.
pub struct OutcomeLog {
    log_dir: PathBuf,
}

impl OutcomeLog {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// The log directory kept next to repository state.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("outcomes"))
    }

    fn log_path(&self, repository: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(repository) {
            return Err(StoreError::InvalidId(repository.to_string()));
        }
        Ok(self.log_dir.join(format!("{}.jsonl", repository)))
    }

    /// Append an outcome to its repository's log.
    pub fn append(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        let path = self.log_path(&outcome.repository)?;
        fs::create_dir_all(&self.log_dir)?;
        let mut line =
            serde_json::to_string(outcome).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// All entries for a repository, oldest first.
    ///
    /// Lines that fail to parse (e.g. a torn final write) are skipped.
    pub fn entries(&self, repository: &str) -> Result<Vec<SyncOutcome>, StoreError> {
        let path = self.log_path(repository)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SyncOutcome>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable outcome log line");
                }
            }
        }
        Ok(entries)
    }

    /// The most recent entry.
    pub fn latest(&self, repository: &str) -> Result<Option<SyncOutcome>, StoreError> {
        Ok(self.entries(repository)?.pop())
    }

    /// Keep only the last `keep` entries. Returns how many were removed.
    pub fn prune(&self, repository: &str, keep: usize) -> Result<usize, StoreError> {
        let path = self.log_path(repository)?;
        let entries = self.entries(repository)?;
        if entries.len() <= keep {
            return Ok(0);
        }
        let removed = entries.len() - keep;

        let mut data = String::new();
        for entry in &entries[removed..] {
            data.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            );
            data.push('\n');
        }
        let tmp_path = path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(removed)
    }
}

impl OutcomeSink for OutcomeLog {
    fn record(&self, outcome: &SyncOutcome) {
        if let Err(e) = self.append(outcome) {
            tracing::warn!(repository = %outcome.repository, error = %e, "failed to append outcome log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use tempfile::TempDir;

    fn outcome(repository: &str, result: CycleResult, serial: u64) -> SyncOutcome {
        SyncOutcome {
            repository: repository.to_string(),
            result,
            serial: Some(serial),
            session_id: Some("S1".to_string()),
            objects: Some(10),
            collisions: 0,
            rejected_objects: 0,
            timestamp: Utc::now(),
            duration: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(CycleResult::NoChange.status(), "no_change");
        assert_eq!(CycleResult::DeltasApplied(2).status(), "deltas_applied");
        assert_eq!(CycleResult::SnapshotFetched.status(), "snapshot_fetched");
        let failed = CycleResult::Failed(FailureReason::new(FailureKind::Timeout, "slow"));
        assert_eq!(failed.status(), "timeout");
        assert!(!failed.is_success());
        assert_eq!(failed.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_outcome_log_append_and_query() {
        let tmp = TempDir::new().unwrap();
        let log = OutcomeLog::new(tmp.path());

        assert!(log.entries("ripe").unwrap().is_empty());
        assert!(log.latest("ripe").unwrap().is_none());

        log.append(&outcome("ripe", CycleResult::SnapshotFetched, 3)).unwrap();
        log.append(&outcome("ripe", CycleResult::DeltasApplied(2), 5)).unwrap();
        log.append(&outcome("arin", CycleResult::NoChange, 1)).unwrap();

        let entries = log.entries("ripe").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].result, CycleResult::SnapshotFetched);
        assert_eq!(log.latest("ripe").unwrap().unwrap().serial, Some(5));
        assert_eq!(log.entries("arin").unwrap().len(), 1);
    }

    #[test]
    fn test_outcome_log_prune() {
        let tmp = TempDir::new().unwrap();
        let log = OutcomeLog::new(tmp.path());
        for serial in 1..=5 {
            log.append(&outcome("ripe", CycleResult::NoChange, serial)).unwrap();
        }

        assert_eq!(log.prune("ripe", 10).unwrap(), 0);
        assert_eq!(log.prune("ripe", 2).unwrap(), 3);
        let serials: Vec<_> = log
            .entries("ripe")
            .unwrap()
            .iter()
            .map(|e| e.serial)
            .collect();
        assert_eq!(serials, vec![Some(4), Some(5)]);
    }

    #[test]
    fn test_outcome_log_skips_torn_lines() {
        let tmp = TempDir::new().unwrap();
        let log = OutcomeLog::new(tmp.path());
        log.append(&outcome("ripe", CycleResult::NoChange, 1)).unwrap();
        let path = tmp.path().join("ripe.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"repository\":\"ri").unwrap();

        assert_eq!(log.entries("ripe").unwrap().len(), 1);
    }

    #[test]
    fn test_fan_out() {
        let a = Arc::new(MemoryOutcomeSink::new());
        let b = Arc::new(MemoryOutcomeSink::new());
        let sinks = OutcomeSinks::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(NoopSink));
        assert_eq!(sinks.len(), 3);

        sinks.record(&outcome("ripe", CycleResult::NoChange, 1));
        sinks.record(&outcome("arin", CycleResult::NoChange, 1));
        assert_eq!(a.len(), 2);
        assert_eq!(b.for_repository("arin").len(), 1);
    }

    type Series = (String, Vec<(String, String)>, DebugValue);

    fn recorded(snapshotter: &Snapshotter) -> Vec<Series> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let key = key.key();
                let labels: Vec<(String, String)> = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.name().to_string(), labels, value)
            })
            .collect()
    }

    fn label<'a>(series: &'a Series, name: &str) -> Option<&'a str> {
        series
            .1
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_metrics_recorder_series() {
        let debugging = DebuggingRecorder::new();
        let snapshotter = debugging.snapshotter();
        let pinned = RepositoryDescriptor::new("ripe", "https://rrdp.ripe.net/notification.xml")
            .with_connect_to("rrdp.ripe.net", "192.0.2.1:443".parse().unwrap());
        let recorder = MetricsRecorder::new().with_repository(&pinned);

        metrics::with_local_recorder(&debugging, || {
            recorder.record(&outcome("ripe", CycleResult::SnapshotFetched, 3));
            recorder.record(&outcome(
                "ripe",
                CycleResult::Failed(FailureReason::new(FailureKind::FetchError, "503")),
                4,
            ));
            recorder.record(&outcome("arin", CycleResult::NoChange, 7));
        });
        let series = recorded(&snapshotter);

        let cycles: Vec<_> = series
            .iter()
            .filter(|s| s.0 == "rrdp_sync_cycles_total")
            .collect();
        assert_eq!(cycles.len(), 3);
        for status in ["snapshot_fetched", "fetch_error"] {
            let counter = cycles
                .iter()
                .find(|s| label(s, "repository") == Some("ripe") && label(s, "status") == Some(status))
                .unwrap();
            assert_eq!(counter.2, DebugValue::Counter(1));
            assert_eq!(label(counter, "connect_to"), Some("rrdp.ripe.net=192.0.2.1:443"));
        }

        let serial = |repository: &str| {
            series
                .iter()
                .find(|s| s.0 == "rrdp_repository_serial" && label(s, "repository") == Some(repository))
                .map(|s| match &s.2 {
                    DebugValue::Gauge(v) => v.0,
                    other => panic!("unexpected value {:?}", other),
                })
        };
        // The failed cycle must not move the gauge.
        assert_eq!(serial("ripe"), Some(3.0));
        assert_eq!(serial("arin"), Some(7.0));

        let arin = series
            .iter()
            .find(|s| s.0 == "rrdp_repository_objects" && label(s, "repository") == Some("arin"))
            .unwrap();
        assert_eq!(label(arin, "connect_to"), Some(""));

        let collisions: Vec<_> = series
            .iter()
            .filter(|s| s.0 == "rrdp_snapshot_uri_collisions")
            .collect();
        assert_eq!(collisions.len(), 1);
        assert_eq!(label(collisions[0], "repository"), Some("ripe"));
    }
}
