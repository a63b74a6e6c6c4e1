//! End-to-end synchronization cycles against an in-memory publication point.

mod common;

use common::{NOTIFICATION_URL, Publication};
use rrdp_core::{
    CycleResult, FailureKind, MemoryFetchClient, MemoryStateStore, RepositoryDescriptor,
    RepositoryState, RepositorySyncWorker, StateStore, SyncOptions,
};
use std::sync::Arc;

struct Harness {
    fetcher: Arc<MemoryFetchClient>,
    store: Arc<MemoryStateStore>,
    worker: RepositorySyncWorker,
    descriptor: RepositoryDescriptor,
}

impl Harness {
    fn new() -> Self {
        let fetcher = Arc::new(MemoryFetchClient::new());
        let store = Arc::new(MemoryStateStore::new());
        let worker = RepositorySyncWorker::new(fetcher.clone(), store.clone());
        Self {
            fetcher,
            store,
            worker,
            descriptor: RepositoryDescriptor::new("repo", NOTIFICATION_URL),
        }
    }

    /// Synchronize from the stored state, as the scheduler would.
    async fn sync(&self) -> CycleResult {
        let current = self.stored().await;
        self.worker
            .synchronize(&self.descriptor, current.as_ref(), SyncOptions::default())
            .await
            .outcome
            .result
    }

    async fn stored(&self) -> Option<RepositoryState> {
        self.store.load("repo").await.unwrap()
    }

    /// Bring the client to `publication`'s serial via its snapshot.
    async fn bootstrap(&self, publication: &Publication) -> RepositoryState {
        publication.install(&self.fetcher);
        assert_eq!(self.sync().await, CycleResult::SnapshotFetched);
        self.stored().await.unwrap()
    }
}

#[tokio::test]
async fn test_scenario_a_contiguous_deltas_applied() {
    let harness = Harness::new();
    let mut publication = Publication::at_serial("S1", 10);
    let before = harness.bootstrap(&publication).await;
    assert_eq!((before.session_id.as_str(), before.serial), ("S1", 10));

    publication.publish("rsync://repo.example.net/ca/new.cer", b"certificate");
    publication.commit();
    publication.withdraw("rsync://repo.example.net/ca/1.roa");
    publication.publish("rsync://repo.example.net/ca/2.roa", b"updated roa");
    publication.commit();
    publication.install(&harness.fetcher);

    assert_eq!(harness.sync().await, CycleResult::DeltasApplied(2));

    let after = harness.stored().await.unwrap();
    assert_eq!((after.session_id.as_str(), after.serial), ("S1", 12));
    assert_eq!(after.objects, publication.digests());
    assert_eq!(harness.fetcher.request_count(&publication.snapshot_url()), 0);
    assert_eq!(harness.fetcher.request_count(&publication.delta_url(11)), 1);
    assert_eq!(harness.fetcher.request_count(&publication.delta_url(12)), 1);
}

#[tokio::test]
async fn test_scenario_b_session_change_fetches_snapshot() {
    let harness = Harness::new();
    harness.bootstrap(&Publication::at_serial("S1", 10)).await;

    let publication = Publication::at_serial("S2", 3);
    publication.install(&harness.fetcher);

    assert_eq!(harness.sync().await, CycleResult::SnapshotFetched);
    let after = harness.stored().await.unwrap();
    assert_eq!((after.session_id.as_str(), after.serial), ("S2", 3));
    assert_eq!(after.objects, publication.digests());
}

#[tokio::test]
async fn test_scenario_c_regressed_serial_leaves_state_unchanged() {
    let harness = Harness::new();
    let before = harness.bootstrap(&Publication::at_serial("S1", 10)).await;

    Publication::at_serial("S1", 9).install(&harness.fetcher);

    let result = harness.sync().await;
    assert_eq!(
        result.failure_kind(),
        Some(FailureKind::NotificationRegressed)
    );
    assert_eq!(harness.stored().await.unwrap(), before);
}

#[tokio::test]
async fn test_hash_mismatch_in_later_delta_commits_nothing() {
    let harness = Harness::new();
    let mut publication = Publication::at_serial("S1", 10);
    let before = harness.bootstrap(&publication).await;

    publication.publish("rsync://repo.example.net/ca/a.cer", b"a");
    publication.commit();
    publication.publish("rsync://repo.example.net/ca/b.cer", b"b");
    publication.commit();
    publication.install(&harness.fetcher);
    // Delta 11 is fine, delta 12 is served with different bytes.
    harness
        .fetcher
        .insert(publication.delta_url(12), "<delta>tampered</delta>");

    let result = harness.sync().await;
    assert_eq!(result.failure_kind(), Some(FailureKind::HashMismatch));
    assert_eq!(harness.stored().await.unwrap(), before);
}

#[tokio::test]
async fn test_snapshot_hash_mismatch() {
    let harness = Harness::new();
    let publication = Publication::at_serial("S1", 4);
    publication.install(&harness.fetcher);
    harness
        .fetcher
        .insert(publication.snapshot_url(), format!("{}\n", publication.snapshot_xml()));

    let result = harness.sync().await;
    assert_eq!(result.failure_kind(), Some(FailureKind::HashMismatch));
    assert!(harness.stored().await.is_none());
}

#[tokio::test]
async fn test_gap_in_deltas_falls_back_to_snapshot() {
    let harness = Harness::new();
    let mut publication = Publication::at_serial("S1", 5);
    harness.bootstrap(&publication).await;

    for n in 0..3 {
        publication.publish(&format!("rsync://repo.example.net/ca/gap{}.cer", n), b"x");
        publication.commit();
    }
    publication.forget_delta(7);
    publication.install(&harness.fetcher);

    assert_eq!(harness.sync().await, CycleResult::SnapshotFetched);
    let after = harness.stored().await.unwrap();
    assert_eq!(after.serial, 8);
    assert_eq!(after.objects, publication.digests());
    assert_eq!(harness.fetcher.request_count(&publication.delta_url(6)), 0);
}

#[tokio::test]
async fn test_unchanged_notification_is_idempotent() {
    let harness = Harness::new();
    let publication = Publication::at_serial("S1", 7);
    let first = harness.bootstrap(&publication).await;
    let requests = harness.fetcher.requests().len();

    assert_eq!(harness.sync().await, CycleResult::NoChange);
    assert_eq!(harness.sync().await, CycleResult::NoChange);

    assert_eq!(harness.stored().await.unwrap(), first);
    // Only the notification was fetched again.
    let again = harness.fetcher.requests();
    assert_eq!(again.len(), requests + 2);
    assert!(again[requests..].iter().all(|u| u == NOTIFICATION_URL));
}

#[tokio::test]
async fn test_delta_conflict_leaves_state_unchanged() {
    let harness = Harness::new();
    let mut publication = Publication::at_serial("S1", 3);
    let mut before = harness.bootstrap(&publication).await;

    // Local state lost an object the next delta replaces.
    before.objects.remove("rsync://repo.example.net/ca/1.roa");
    harness.store.store("repo", &before).await.unwrap();

    publication.publish("rsync://repo.example.net/ca/1.roa", b"replacement");
    publication.commit();
    publication.install(&harness.fetcher);

    let result = harness.sync().await;
    assert_eq!(result.failure_kind(), Some(FailureKind::DeltaConflict));
    assert_eq!(harness.stored().await.unwrap(), before);

    // A forced snapshot repairs it.
    let current = harness.stored().await;
    let report = harness
        .worker
        .synchronize(
            &harness.descriptor,
            current.as_ref(),
            SyncOptions {
                force_snapshot: true,
                if_modified_since: None,
            },
        )
        .await;
    assert_eq!(report.outcome.result, CycleResult::SnapshotFetched);
    assert_eq!(harness.stored().await.unwrap().objects, publication.digests());
}

#[tokio::test]
async fn test_delta_document_must_match_advertised_serial() {
    let harness = Harness::new();
    let mut publication = Publication::at_serial("S1", 3);
    let before = harness.bootstrap(&publication).await;

    publication.publish("rsync://repo.example.net/ca/x.cer", b"x");
    publication.commit();
    publication.publish("rsync://repo.example.net/ca/y.cer", b"y");
    publication.commit();

    // Serve delta 5's document under delta 4's URI and advertise it there.
    let wrong = publication.delta_xml(5).unwrap().to_string();
    let notification = publication.notification_xml().replace(
        &rrdp_core::ContentHash::of(publication.delta_xml(4).unwrap().as_bytes()).to_hex(),
        &rrdp_core::ContentHash::of(wrong.as_bytes()).to_hex(),
    );
    publication.install(&harness.fetcher);
    harness.fetcher.insert(publication.delta_url(4), wrong);
    harness.fetcher.insert(NOTIFICATION_URL, notification);

    let result = harness.sync().await;
    assert_eq!(result.failure_kind(), Some(FailureKind::DocumentMismatch));
    assert_eq!(harness.stored().await.unwrap(), before);
}

#[tokio::test]
async fn test_fetch_and_parse_failures() {
    let harness = Harness::new();
    // Nothing served yet.
    assert_eq!(harness.sync().await.failure_kind(), Some(FailureKind::FetchError));

    harness.fetcher.insert(NOTIFICATION_URL, "<notification");
    assert_eq!(harness.sync().await.failure_kind(), Some(FailureKind::ParseError));

    harness.fetcher.fail_with_status(NOTIFICATION_URL, 503);
    assert_eq!(harness.sync().await.failure_kind(), Some(FailureKind::FetchError));
    assert!(harness.stored().await.is_none());
}

#[tokio::test]
async fn test_snapshot_duplicate_uris_keep_first() {
    let harness = Harness::new();
    let publication = Publication::at_serial("S1", 2);
    let mut snapshot = publication.snapshot_xml();
    snapshot = snapshot.replace(
        "</snapshot>",
        "<publish uri=\"rsync://repo.example.net/ca/1.roa\">ZHVw</publish></snapshot>",
    );
    let notification = publication.notification_xml().replace(
        &rrdp_core::ContentHash::of(publication.snapshot_xml().as_bytes()).to_hex(),
        &rrdp_core::ContentHash::of(snapshot.as_bytes()).to_hex(),
    );
    harness.fetcher.insert(NOTIFICATION_URL, notification);
    harness.fetcher.insert(publication.snapshot_url(), snapshot);

    let report = harness
        .worker
        .synchronize(&harness.descriptor, None, SyncOptions::default())
        .await;
    assert_eq!(report.outcome.result, CycleResult::SnapshotFetched);
    assert_eq!(report.outcome.collisions, 1);
    assert_eq!(report.state.unwrap().objects, publication.digests());
}
