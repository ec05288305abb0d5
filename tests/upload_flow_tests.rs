mod common;

use chunk_ingest::{
    errors::UploadError,
    models::session::{SessionState, UploadId},
    services::upload_service::UploadLimits,
};
use common::{Harness, send, test_limits};
use std::{path::PathBuf, time::Duration};

const PAYLOADS: [&str; 3] = ["alpha-", "bravo-", "charlie"];

/// Put a plain file where the document artifact directory belongs, so
/// writing an artifact fails with an I/O error until it is removed.
fn block_artifact_dir(h: &Harness) -> PathBuf {
    let blocker = h.dir.path().join("uploads/artifacts/document");
    std::fs::write(&blocker, b"not a directory").unwrap();
    blocker
}

#[tokio::test]
async fn every_arrival_order_assembles_in_index_order() {
    let orders: [[u32; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for (n, order) in orders.iter().enumerate() {
        let h = Harness::new().await;
        let upload_id = format!("perm-{n}");
        let mut last = None;
        for (position, &index) in order.iter().enumerate() {
            let ack = h.send(&upload_id, index, 3, PAYLOADS[index as usize]).await.unwrap();
            assert_eq!(ack.complete, position == 2, "order {order:?}");
            last = Some(ack);
        }

        let ack = last.unwrap();
        assert_eq!(h.artifact_bytes(&ack), b"alpha-bravo-charlie", "order {order:?}");
        assert_eq!(h.registry.registered().len(), 1);
        assert_eq!(h.service.budget().used(), 0);
    }
}

#[tokio::test]
async fn scenario_one_zero_two_completes_only_after_last() {
    let h = Harness::new().await;

    let ack = h.send("lecture-7", 1, 3, "p1").await.unwrap();
    assert!(!ack.complete);
    assert_eq!(ack.received, 1);
    assert!(ack.artifact.is_none());

    let ack = h.send("lecture-7", 0, 3, "p0").await.unwrap();
    assert!(!ack.complete);
    assert_eq!(ack.received, 2);

    let ack = h.send("lecture-7", 2, 3, "p2").await.unwrap();
    assert!(ack.complete);
    assert_eq!(ack.received, 3);
    let artifact = ack.artifact.clone().unwrap();
    assert!(artifact.name.ends_with("-notes.txt"));
    assert_eq!(artifact.size_bytes, 6);
    assert_eq!(h.artifact_bytes(&ack), b"p0p1p2");
}

#[tokio::test]
async fn duplicate_indices_never_complete_early() {
    let h = Harness::new().await;

    for _ in 0..4 {
        let ack = h.send("dupes", 0, 2, "same").await.unwrap();
        assert!(!ack.complete);
        assert_eq!(ack.received, 1);
    }
    let status = h.service.status("dupes").await.unwrap();
    assert_eq!(status.state, SessionState::Receiving);
    assert_eq!(status.missing, vec![1]);
    assert_eq!(status.staged_bytes, 4);
    assert!(h.artifact_files().is_empty());
}

#[tokio::test]
async fn resent_chunk_replaces_previous_bytes() {
    let h = Harness::new().await;

    h.send("resend", 0, 2, "first-attempt").await.unwrap();
    assert_eq!(h.service.budget().used(), 13);
    h.send("resend", 0, 2, "ok").await.unwrap();
    assert_eq!(h.service.budget().used(), 2);

    let ack = h.send("resend", 1, 2, "-done").await.unwrap();
    assert_eq!(h.artifact_bytes(&ack), b"ok-done");
    assert_eq!(h.service.budget().used(), 0);
}

#[tokio::test]
async fn concurrent_final_chunks_assemble_once() {
    let h = Harness::new().await;
    h.send("race", 0, 3, "a").await.unwrap();
    h.send("race", 1, 3, "b").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move { send(&service, "race", 2, 3, "c").await }));
    }

    let mut names = Vec::new();
    for task in tasks {
        let ack = task.await.unwrap().unwrap();
        assert!(ack.complete);
        names.push(ack.artifact.unwrap().name);
    }
    names.dedup();
    assert_eq!(names.len(), 1);

    assert_eq!(h.registry.registered().len(), 1);
    assert_eq!(h.artifact_files(), names);
    assert_eq!(std::fs::read(h.artifact_path(&names[0])).unwrap(), b"abc");
}

#[tokio::test]
async fn late_retries_of_final_chunk_return_same_artifact() {
    let h = Harness::new().await;
    h.send("retry", 0, 2, "x").await.unwrap();
    let first = h.send("retry", 1, 2, "y").await.unwrap();

    for _ in 0..2 {
        let again = h.send("retry", 1, 2, "y").await.unwrap();
        assert_eq!(again.artifact, first.artifact);
    }
    assert_eq!(h.registry.registered().len(), 1);
    assert_eq!(h.artifact_files().len(), 1);
}

#[tokio::test]
async fn idle_session_is_swept_and_closed() {
    let h = Harness::with_limits(UploadLimits {
        session_ttl: Duration::ZERO,
        ..test_limits()
    })
    .await;

    h.send("stale", 0, 5, "zero").await.unwrap();
    h.send("stale", 1, 5, "one").await.unwrap();
    assert_eq!(h.service.budget().used(), 7);
    let staging = h.service.staging_dir(&UploadId::parse("stale").unwrap());
    assert!(staging.exists());

    let report = h.service.sweep_expired().await;
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.bytes_freed, 7);
    assert_eq!(h.service.budget().used(), 0);
    assert!(!staging.exists());

    let err = h.send("stale", 2, 5, "two").await.unwrap_err();
    assert!(matches!(err, UploadError::SessionClosed(_)));
    assert_eq!(h.service.budget().used(), 0);
}

#[tokio::test]
async fn mismatched_total_aborts_upload() {
    let h = Harness::new().await;
    h.send("mismatch", 0, 3, "aaa").await.unwrap();

    let err = h.send("mismatch", 1, 4, "bbb").await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::InconsistentTransfer {
            recorded: 3,
            claimed: 4,
            ..
        }
    ));
    assert_eq!(h.service.budget().used(), 0);

    let err = h.send("mismatch", 1, 3, "bbb").await.unwrap_err();
    assert!(matches!(err, UploadError::SessionClosed(_)));
}

#[tokio::test]
async fn exhausted_staging_rejects_without_leaking() {
    let limits = UploadLimits {
        max_staged_bytes: 8,
        ..test_limits()
    };
    let h = Harness::with_limits(limits).await;

    h.send("big", 0, 3, "12345678").await.unwrap();
    assert_eq!(h.service.budget().used(), 8);

    let err = h.send("big", 1, 3, "9").await.unwrap_err();
    assert!(matches!(err, UploadError::StorageExhausted { .. }));
    assert!(err.is_retryable());
    assert_eq!(h.service.budget().used(), 8);

    let err = h.send("newcomer", 0, 2, "z").await.unwrap_err();
    assert!(matches!(err, UploadError::StorageExhausted { .. }));
    assert!(matches!(
        h.service.status("newcomer").await,
        Err(UploadError::UnknownUpload(_))
    ));
}

#[tokio::test]
async fn first_chunk_that_does_not_fit_leaves_no_session() {
    let h = Harness::with_limits(UploadLimits {
        max_staged_bytes: 8,
        ..test_limits()
    })
    .await;
    h.send("resident", 0, 2, "1234567").await.unwrap();

    let err = h.send("newcomer", 0, 2, "abcd").await.unwrap_err();
    assert!(matches!(err, UploadError::StorageExhausted { .. }));
    assert!(matches!(
        h.service.status("newcomer").await,
        Err(UploadError::UnknownUpload(_))
    ));
    let staging = h.service.staging_dir(&UploadId::parse("newcomer").unwrap());
    assert!(!staging.exists());
    assert_eq!(h.service.budget().used(), 7);

    // The id was never opened for good, so it can try again once space frees.
    h.service.abandon("resident").await.unwrap();
    let ack = h.send("newcomer", 0, 2, "abcd").await.unwrap();
    assert_eq!(ack.received, 1);
    assert_eq!(h.service.budget().used(), 4);
}

#[tokio::test]
async fn transient_assembly_failure_allows_resend() {
    let h = Harness::new().await;
    let blocker = block_artifact_dir(&h);
    h.send("flaky", 0, 2, "left-").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move { send(&service, "flaky", 1, 2, "right").await }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)), "{err}");
        assert!(err.is_retryable());
    }

    let status = h.service.status("flaky").await.unwrap();
    assert_eq!(status.state, SessionState::Complete);
    assert_eq!(status.staged_bytes, 10);
    assert_eq!(h.service.budget().used(), 10);
    assert!(h.registry.registered().is_empty());

    std::fs::remove_file(&blocker).unwrap();
    let ack = h.send("flaky", 1, 2, "right").await.unwrap();
    assert!(ack.complete);
    assert_eq!(h.artifact_bytes(&ack), b"left-right");
    assert_eq!(h.registry.registered().len(), 1);
    assert_eq!(h.service.budget().used(), 0);
}

#[tokio::test]
async fn session_left_complete_by_failed_assembly_is_reclaimed() {
    let h = Harness::with_limits(UploadLimits {
        session_ttl: Duration::ZERO,
        ..test_limits()
    })
    .await;
    block_artifact_dir(&h);

    for upload_id in ["stuck-swept", "stuck-abandoned"] {
        h.send(upload_id, 0, 2, "four").await.unwrap();
        let err = h.send(upload_id, 1, 2, "more").await.unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)));
    }
    assert_eq!(h.service.budget().used(), 16);

    assert_eq!(h.service.abandon("stuck-abandoned").await.unwrap(), 8);
    let report = h.service.sweep_expired().await;
    assert_eq!(report.abandoned, vec![UploadId::parse("stuck-swept").unwrap()]);
    assert_eq!(report.bytes_freed, 8);
    assert_eq!(h.service.budget().used(), 0);

    for upload_id in ["stuck-swept", "stuck-abandoned"] {
        let staging = h.service.staging_dir(&UploadId::parse(upload_id).unwrap());
        assert!(!staging.exists(), "{upload_id}");
    }
    let err = h.send("stuck-swept", 1, 2, "more").await.unwrap_err();
    assert!(matches!(err, UploadError::SessionClosed(_)));
}

#[tokio::test]
async fn registry_failure_surfaces_until_resend_registers() {
    let h = Harness::new().await;
    h.registry.fail_next(1);
    h.send("ledger", 0, 2, "first-").await.unwrap();

    let err = h.send("ledger", 1, 2, "second").await.unwrap_err();
    assert!(matches!(err, UploadError::Registry(_)));
    assert!(err.is_retryable());
    assert!(h.artifact_files().is_empty());
    let status = h.service.status("ledger").await.unwrap();
    assert_eq!(status.state, SessionState::Complete);
    assert!(status.artifact.is_none());

    let ack = h.send("ledger", 1, 2, "second").await.unwrap();
    let name = ack.artifact.clone().unwrap().name;
    let registered = h.registry.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].name, name);
    assert_eq!(h.artifact_bytes(&ack), b"first-second");

    let again = h.send("ledger", 1, 2, "second").await.unwrap();
    assert_eq!(again.artifact, ack.artifact);
    assert_eq!(h.registry.registered().len(), 1);
}

#[tokio::test]
async fn missing_chunk_file_fails_assembly_and_keeps_staging() {
    let h = Harness::new().await;
    h.send("lost", 0, 3, "zero").await.unwrap();
    h.send("lost", 1, 3, "one").await.unwrap();

    let staging = h.service.staging_dir(&UploadId::parse("lost").unwrap());
    std::fs::remove_file(staging.join("0.chunk")).unwrap();

    let err = h.send("lost", 2, 3, "two").await.unwrap_err();
    assert!(matches!(err, UploadError::IncompleteTransfer { .. }));
    assert!(!err.is_retryable());

    assert!(staging.join("1.chunk").exists());
    assert!(staging.join("2.chunk").exists());
    assert_eq!(h.service.status("lost").await.unwrap().state, SessionState::Failed);
    assert!(h.registry.registered().is_empty());
    assert!(h.artifact_files().is_empty());

    // Failed sessions stay until abandoned.
    assert!(h.service.abandon("lost").await.unwrap() > 0);
    assert!(!staging.exists());
    assert_eq!(h.service.budget().used(), 0);
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_staging() {
    let h = Harness::new().await;

    let cases = [("../escape", 0, 1), ("ok", 3, 3), ("ok", 0, 0), ("ok", 0, 5000)];
    for (upload_id, index, total) in cases {
        let err = h.send(upload_id, index, total, "x").await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)), "{upload_id} {index}/{total}");
    }
    assert_eq!(h.service.budget().used(), 0);
    assert!(matches!(
        h.service.status("ok").await,
        Err(UploadError::UnknownUpload(_))
    ));
}

#[tokio::test]
async fn orphan_purge_clears_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let leftover = dir.path().join("uploads/staging/7f/crashed/0.chunk");
    std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
    std::fs::write(&leftover, b"partial").unwrap();

    let service = common::sqlite_service(&dir).await;
    assert_eq!(service.purge_orphans().await.unwrap(), 1);
    assert!(!leftover.exists());
}
