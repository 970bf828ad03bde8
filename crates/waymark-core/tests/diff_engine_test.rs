//! Integration tests for the optimistic diff engine.
//!
//! Exercises batches end to end through the service against an in-memory
//! SQLite store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use waymark_core::{
    CommitPlan, CommitReceipt, DiffBatch, DiffConfig, DiffOperation, DiffState, ElementLookup,
    ElementMember, ElementRef, ElementService, ElementStore, ElementVersion, EngineConfig,
    ErrorCode, Point, SequenceId, SqliteElementStore, VersionQuery, VersionedElementRef,
    WaymarkError, WaymarkResult,
};

fn fast_retry(retry_timeout_ms: u64) -> DiffConfig {
    DiffConfig {
        retry_timeout_ms,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        ..DiffConfig::default()
    }
}

fn service() -> ElementService {
    ElementService::open(EngineConfig::builder().in_memory().diff(fast_retry(2_000)).build())
        .unwrap()
}

/// Two nodes and a way over them. Returns (n1, n2, w).
async fn seed_way(service: &ElementService) -> (ElementRef, ElementRef, ElementRef) {
    let batch = DiffBatch::new(1)
        .push(DiffOperation::create_node(-1, Point::new(21.0, 52.0)))
        .push(DiffOperation::create_node(-2, Point::new(21.1, 52.1)))
        .push(
            DiffOperation::create_way(-1, [ElementRef::node(-1), ElementRef::node(-2)])
                .with_tag("highway", "residential"),
        );
    let ids = service.submit_diff(&batch).await.unwrap().assigned_ids();
    (
        ids[&ElementRef::node(-1)],
        ids[&ElementRef::node(-2)],
        ids[&ElementRef::way(-1)],
    )
}

async fn current(service: &ElementService, element: ElementRef) -> ElementVersion {
    service
        .resolve(&[ElementLookup::Current(element)], None)
        .await
        .unwrap()
        .remove(0)
}

#[tokio::test]
async fn test_create_assigns_real_ids() {
    let service = service();
    let batch = DiffBatch::new(7).push(
        DiffOperation::create_node(-1, Point::new(0.5, 0.5)).with_tag("amenity", "bench"),
    );

    let result = service.submit_diff(&batch).await.unwrap();

    assert_eq!(result.entries.len(), 1);
    assert_eq!(result.attempts, 1);
    assert_eq!(
        result.states,
        vec![DiffState::Pending, DiffState::Validating, DiffState::Committed]
    );
    let entry = &result.entries[0];
    assert_eq!(entry.old_ref, ElementRef::node(-1));
    assert!(entry.new_ref.id > 0);
    assert_eq!(entry.new_version, 1);

    let node = current(&service, entry.new_ref).await;
    assert_eq!(node.version, 1);
    assert!(node.visible);
    assert_eq!(node.changeset_id, 7);
    assert_eq!(node.tags["amenity"], "bench");
    assert_eq!(node.sequence_id, entry.sequence_id);
}

#[tokio::test]
async fn test_placeholder_members_resolve_to_real_ids() {
    let service = service();
    let (n1, n2, way) = seed_way(&service).await;

    let way = current(&service, way).await;
    assert_eq!(way.member_refs().collect::<Vec<_>>(), vec![n1, n2]);
}

#[tokio::test]
async fn test_modify_supersedes_previous_version() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;

    let batch = DiffBatch::new(2).push(
        DiffOperation::modify(n1, 1)
            .with_point(Point::new(21.5, 52.5))
            .with_tag("name", "moved"),
    );
    let result = service.submit_diff(&batch).await.unwrap();
    let entry = &result.entries[0];
    assert_eq!(entry.new_ref, n1);
    assert_eq!(entry.new_version, 2);

    let v1 = service
        .resolve(&[ElementLookup::Versioned(n1.with_version(1))], None)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(v1.next_sequence_id, Some(entry.sequence_id));

    let v2 = current(&service, n1).await;
    assert_eq!(v2.version, 2);
    assert!(v2.is_current());
    assert_eq!(v2.point, Some(Point::new(21.5, 52.5)));
}

#[tokio::test]
async fn test_create_then_modify_in_one_batch() {
    let service = service();
    let batch = DiffBatch::new(1)
        .push(DiffOperation::create_node(-1, Point::new(1.0, 1.0)))
        .push(DiffOperation::modify(ElementRef::node(-1), 1).with_point(Point::new(2.0, 2.0)));

    let result = service.submit_diff(&batch).await.unwrap();
    assert_eq!(result.entries[0].new_ref, result.entries[1].new_ref);
    assert_eq!(result.entries[1].new_version, 2);
    assert!(result.entries[0].sequence_id < result.entries[1].sequence_id);

    let node = current(&service, result.entries[0].new_ref).await;
    assert_eq!(node.version, 2);
    assert_eq!(node.point, Some(Point::new(2.0, 2.0)));
}

#[tokio::test]
async fn test_delete_of_referenced_node_is_rejected() {
    let service = service();
    let (n1, _, way) = seed_way(&service).await;
    let before = service.current_sequence_id().await.unwrap();

    let err = service
        .submit_diff(&DiffBatch::new(2).push(DiffOperation::delete(n1, 1)))
        .await
        .unwrap_err();

    match err {
        WaymarkError::StillReferenced {
            element,
            referenced_by,
            ..
        } => {
            assert_eq!(element, n1);
            assert_eq!(referenced_by, vec![way]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.current_sequence_id().await.unwrap(), before);
}

#[tokio::test]
async fn test_delete_way_and_nodes_together() {
    let service = service();
    let (n1, n2, way) = seed_way(&service).await;

    let batch = DiffBatch::new(2)
        .push(DiffOperation::delete(way, 1))
        .push(DiffOperation::delete(n1, 1))
        .push(DiffOperation::delete(n2, 1));
    let result = service.submit_diff(&batch).await.unwrap();
    assert!(result.entries.iter().all(|e| e.new_version == 2));

    let node = current(&service, n1).await;
    assert!(!node.visible);
    assert!(node.tags.is_empty());
    assert!(node.point.is_none());
}

#[tokio::test]
async fn test_delete_referenced_by_batch_final_state() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;

    let batch = DiffBatch::new(2)
        .push(DiffOperation::create_way(-5, [n1]))
        .push(DiffOperation::delete(n1, 1));
    let err = service.submit_diff(&batch).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ElemStillReferenced);
}

#[tokio::test]
async fn test_stale_base_version_conflicts() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;
    let modify = |base| {
        DiffBatch::new(2).push(DiffOperation::modify(n1, base).with_point(Point::new(3.0, 3.0)))
    };
    service.submit_diff(&modify(1)).await.unwrap();
    let before = service.current_sequence_id().await.unwrap();

    let err = service.submit_diff(&modify(1)).await.unwrap_err();
    match err {
        WaymarkError::Conflict {
            code,
            element,
            expected,
            actual,
            ..
        } => {
            assert_eq!(code, ErrorCode::DiffVersionMismatch);
            assert_eq!(element, Some(n1));
            assert_eq!(expected, Some(1));
            assert_eq!(actual, Some(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.current_sequence_id().await.unwrap(), before);
}

#[tokio::test]
async fn test_modify_unknown_element_is_not_found() {
    let service = service();
    let err = service
        .submit_diff(
            &DiffBatch::new(1)
                .push(DiffOperation::modify(ElementRef::node(404), 1).with_point(Point::new(0.0, 0.0))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WaymarkError::NotFound { .. }));
}

#[tokio::test]
async fn test_referential_rules() {
    let service = service();
    let (n1, _, way) = seed_way(&service).await;

    let dangling = DiffBatch::new(1).push(DiffOperation::create_way(-1, [n1, ElementRef::node(999)]));
    assert_eq!(
        service.submit_diff(&dangling).await.unwrap_err().code(),
        ErrorCode::ValDanglingReference
    );

    let unknown_placeholder =
        DiffBatch::new(1).push(DiffOperation::create_way(-1, [ElementRef::node(-9)]));
    assert_eq!(
        service.submit_diff(&unknown_placeholder).await.unwrap_err().code(),
        ErrorCode::ValBadPlaceholder
    );

    let way_in_way = DiffBatch::new(1).push(DiffOperation::create_way(-1, [way]));
    assert_eq!(
        service.submit_diff(&way_in_way).await.unwrap_err().code(),
        ErrorCode::ValBadMember
    );

    let relation = DiffBatch::new(1).push(DiffOperation::create_relation(
        -1,
        [
            ElementMember::with_role(way, "outer"),
            ElementMember::with_role(n1, "label"),
        ],
    ));
    assert!(service.submit_diff(&relation).await.is_ok());
}

#[tokio::test]
async fn test_member_deleted_before_batch_is_dangling() {
    let service = service();
    let created = service
        .submit_diff(&DiffBatch::new(1).push(DiffOperation::create_node(-1, Point::new(0.0, 0.0))))
        .await
        .unwrap();
    let node = created.entries[0].new_ref;
    service
        .submit_diff(&DiffBatch::new(1).push(DiffOperation::delete(node, 1)))
        .await
        .unwrap();

    let err = service
        .submit_diff(&DiffBatch::new(1).push(DiffOperation::create_way(-1, [node])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValDanglingReference);

    let err = service
        .submit_diff(&DiffBatch::new(1).push(DiffOperation::delete(node, 2)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValAlreadyDeleted);
}

#[tokio::test]
async fn test_failed_batch_writes_nothing() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;
    let before = service.current_sequence_id().await.unwrap();

    let batch = DiffBatch::new(3)
        .push(DiffOperation::create_node(-1, Point::new(5.0, 5.0)))
        .push(DiffOperation::modify(n1, 1).with_point(Point::new(6.0, 6.0)))
        .push(DiffOperation::modify(n1, 1).with_point(Point::new(7.0, 7.0)));
    let err = service.submit_diff(&batch).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DiffVersionMismatch);

    assert_eq!(service.current_sequence_id().await.unwrap(), before);
    assert_eq!(current(&service, n1).await.version, 1);
    let missing = service
        .resolve(&[ElementLookup::Current(ElementRef::node(3))], None)
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_invalid_batches_are_rejected() {
    let service = service();

    let bad_changeset = DiffBatch::new(0).push(DiffOperation::create_node(-1, Point::new(0.0, 0.0)));
    assert_eq!(
        service.submit_diff(&bad_changeset).await.unwrap_err().code(),
        ErrorCode::ValInvalidInput
    );

    let duplicate = DiffBatch::new(1)
        .push(DiffOperation::create_node(-1, Point::new(0.0, 0.0)))
        .push(DiffOperation::create_node(-1, Point::new(1.0, 1.0)));
    assert_eq!(
        service.submit_diff(&duplicate).await.unwrap_err().code(),
        ErrorCode::ValBadPlaceholder
    );

    let empty = service.submit_diff(&DiffBatch::new(1)).await.unwrap();
    assert!(empty.entries.is_empty());
    assert_eq!(service.current_sequence_id().await.unwrap(), SequenceId::ZERO);
}

#[tokio::test]
async fn test_versions_are_gapless() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;
    for base in 1..=4 {
        let batch = DiffBatch::new(2)
            .push(DiffOperation::modify(n1, base).with_point(Point::new(base as f64, 0.0)));
        service.submit_diff(&batch).await.unwrap();
    }

    let at = service.current_sequence_id().await.unwrap();
    let versions = service
        .store()
        .get_versions(n1, at, VersionQuery::oldest_first())
        .await
        .unwrap();
    assert_eq!(
        versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    for pair in versions.windows(2) {
        assert_eq!(pair[0].next_sequence_id, Some(pair[1].sequence_id));
    }
    assert_eq!(versions.iter().filter(|v| v.is_current()).count(), 1);
}

#[tokio::test]
async fn test_reads_before_creation_omit_element() {
    let service = service();
    let before = service.current_sequence_id().await.unwrap();
    let (n1, _, _) = seed_way(&service).await;

    let rows = service
        .resolve(&[ElementLookup::Current(n1)], Some(before))
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_modify_exactly_one_wins() {
    let service = service();
    let (n1, _, _) = seed_way(&service).await;

    let submit = |lon: f64| {
        let service = service.clone();
        tokio::spawn(async move {
            let batch = DiffBatch::new(9)
                .push(DiffOperation::modify(n1, 1).with_point(Point::new(lon, 0.0)));
            service.submit_diff(&batch).await
        })
    };
    let (a, b) = tokio::join!(submit(10.0), submit(20.0));
    let outcomes = [a.unwrap(), b.unwrap()];

    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.code(), ErrorCode::DiffVersionMismatch);

    let node = current(&service, n1).await;
    assert_eq!(node.version, 2);

    let retry = DiffBatch::new(9).push(DiffOperation::modify(n1, 2).with_point(Point::new(30.0, 0.0)));
    let result = service.submit_diff(&retry).await.unwrap();
    assert_eq!(result.entries[0].new_version, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_on_one_file_share_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let open = || {
        ElementService::open(
            EngineConfig::builder()
                .database_path(&path)
                .diff(fast_retry(10_000))
                .build(),
        )
        .unwrap()
    };
    let first = open();
    let second = open();

    let created = first
        .submit_diff(&DiffBatch::new(1).push(DiffOperation::create_node(-1, Point::new(0.0, 0.0))))
        .await
        .unwrap();
    let node = created.entries[0].new_ref;

    for base in 1..=20u32 {
        let submit = |service: &ElementService, lon: f64| {
            let service = service.clone();
            tokio::spawn(async move {
                let batch = DiffBatch::new(2)
                    .push(DiffOperation::modify(node, base).with_point(Point::new(lon, 0.0)));
                service.submit_diff(&batch).await
            })
        };
        let (a, b) = tokio::join!(submit(&first, 1.0), submit(&second, 2.0));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1, "round {}", base);
        let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.code(), ErrorCode::DiffVersionMismatch, "round {}", base);
    }

    assert_eq!(first.current_sequence_id().await.unwrap(), SequenceId::new(21));
    assert_eq!(second.current_sequence_id().await.unwrap(), SequenceId::new(21));
    assert_eq!(current(&second, node).await.version, 21);

    let next = second
        .submit_diff(&DiffBatch::new(3).push(DiffOperation::create_node(-1, Point::new(1.0, 1.0))))
        .await
        .unwrap();
    assert_eq!(next.entries[0].new_ref, ElementRef::node(node.id + 1));
    assert_eq!(next.entries[0].sequence_id, SequenceId::new(22));
}

/// Store wrapper whose commits fail with a chosen error a number of times.
struct FlakyStore {
    inner: SqliteElementStore,
    failures: AtomicU32,
    busy: bool,
}

impl FlakyStore {
    fn new(failures: u32, busy: bool) -> Self {
        Self {
            inner: SqliteElementStore::in_memory().unwrap(),
            failures: AtomicU32::new(failures),
            busy,
        }
    }
}

#[async_trait]
impl ElementStore for FlakyStore {
    async fn current_sequence_id(&self) -> WaymarkResult<SequenceId> {
        self.inner.current_sequence_id().await
    }

    async fn get_by_refs(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        recurse_ways: bool,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.inner.get_by_refs(refs, at, recurse_ways, limit).await
    }

    async fn get_by_versioned_refs(
        &self,
        refs: &[VersionedElementRef],
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.inner.get_by_versioned_refs(refs, limit).await
    }

    async fn get_versions(
        &self,
        element: ElementRef,
        at: SequenceId,
        query: VersionQuery,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.inner.get_versions(element, at, query).await
    }

    async fn get_current_version(
        &self,
        element: ElementRef,
        at: SequenceId,
    ) -> WaymarkResult<u32> {
        self.inner.get_current_version(element, at).await
    }

    async fn get_many_parents(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.inner.get_many_parents(refs, at, limit).await
    }

    async fn commit(&self, plan: CommitPlan) -> WaymarkResult<CommitReceipt> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(if self.busy {
                WaymarkError::unavailable("database is locked")
            } else {
                WaymarkError::stale_snapshot("concurrent commit")
            });
        }
        self.inner.commit(plan).await
    }
}

fn flaky_service(failures: u32, busy: bool, retry_timeout_ms: u64) -> ElementService {
    let config = EngineConfig::builder()
        .in_memory()
        .diff(fast_retry(retry_timeout_ms))
        .build();
    ElementService::new(config, Arc::new(FlakyStore::new(failures, busy))).unwrap()
}

fn one_node() -> DiffBatch {
    DiffBatch::new(1).push(DiffOperation::create_node(-1, Point::new(0.0, 0.0)))
}

#[tokio::test]
async fn test_stale_snapshot_is_retried() {
    let service = flaky_service(2, false, 5_000);
    let result = service.submit_diff(&one_node()).await.unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.entries[0].new_ref, ElementRef::node(1));
    assert_eq!(
        result.states,
        vec![
            DiffState::Pending,
            DiffState::Validating,
            DiffState::Conflicted,
            DiffState::Validating,
            DiffState::Conflicted,
            DiffState::Validating,
            DiffState::Committed,
        ]
    );
}

#[tokio::test]
async fn test_retry_window_exhaustion_is_conflict() {
    let service = flaky_service(u32::MAX, false, 50);
    let err = service.submit_diff(&one_node()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DiffRetryExhausted);
    assert!(matches!(err, WaymarkError::Conflict { .. }));
    assert_eq!(service.current_sequence_id().await.unwrap(), SequenceId::ZERO);
}

#[tokio::test]
async fn test_persistent_busy_storage_is_unavailable() {
    let service = flaky_service(u32::MAX, true, 50);
    let err = service.submit_diff(&one_node()).await.unwrap_err();
    assert!(matches!(err, WaymarkError::Unavailable { .. }));
}

#[tokio::test]
async fn test_busy_storage_recovers_within_window() {
    let service = flaky_service(1, true, 5_000);
    let result = service.submit_diff(&one_node()).await.unwrap();
    assert_eq!(result.attempts, 2);
}
