//! Integration tests for the chunked transfer engine.
//!
//! Two engines share one negotiated in-memory link. Stalled pairs never
//! answer the requester, which keeps admitted downloads in flight for the
//! admission and cancellation tests.

use huddle_core::{Error, TransferConfig, TransferStatus};
use huddle_files::plan_ranges;
use huddle_tests::fixtures::{EnginePair, SHARE_ROOT, descriptor};
use huddle_tests::test_helpers::wait_until;
use std::path::Path;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn limited(max_concurrent_transfers: usize) -> TransferConfig {
    TransferConfig {
        max_concurrent_transfers,
        ..TransferConfig::default()
    }
}

fn count_status(pair: &EnginePair, ids: &[String], status: TransferStatus) -> usize {
    ids.iter()
        .filter(|id| pair.requester.progress(id).is_some_and(|p| p.status == status))
        .count()
}

// ============================================================================
// Full downloads
// ============================================================================

#[tokio::test]
async fn test_twelve_mib_file_uses_eight_threads() {
    const SIZE: u64 = 12_582_912;

    let ranges = plan_ranges(SIZE);
    assert_eq!(ranges.len(), 8);
    assert!(ranges.iter().all(|r| r.len() == 1_572_864));
    assert_eq!(ranges[7].end, SIZE);

    let pair = EnginePair::new(TransferConfig {
        frame_chunk_size: 256 * 1024,
        ..TransferConfig::default()
    })
    .await;
    let data: Vec<u8> = (0..SIZE).map(|i| (i % 241) as u8).collect();
    pair.owner_store
        .insert(format!("{SHARE_ROOT}/map.pak"), data.clone())
        .await;

    let id = pair
        .requester
        .request_download(descriptor("share-1", "owner", "map.pak", SIZE), "/dl/map.pak")
        .unwrap();
    let progress = pair.wait_terminal(&id).await;

    assert_eq!(progress.status, TransferStatus::Completed, "{:?}", progress.error);
    assert_eq!(progress.transferred, SIZE);
    assert_eq!(pair.requester_store.get(Path::new("/dl/map.pak")).await, Some(data));

    let owner = &pair.owner;
    wait_until("uploads to wind down", TIMEOUT, || owner.active_uploads() == 0).await;
}

#[tokio::test]
async fn test_concurrent_downloads_complete_independently() {
    let pair = EnginePair::new(limited(2)).await;
    let mut ids = Vec::new();
    for n in 0..4u8 {
        let name = format!("part-{n}.bin");
        let data = vec![n; 40_000 + usize::from(n)];
        pair.owner_store.insert(format!("{SHARE_ROOT}/{name}"), data).await;
        let id = pair
            .requester
            .request_download(
                descriptor("share-1", "owner", &name, 40_000 + u64::from(n)),
                format!("/dl/{name}"),
            )
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert_eq!(pair.wait_terminal(id).await.status, TransferStatus::Completed);
    }
    for n in 0..4u8 {
        let saved = pair
            .requester_store
            .get(Path::new(&format!("/dl/part-{n}.bin")))
            .await
            .unwrap();
        assert_eq!(saved.len(), 40_000 + usize::from(n));
        assert!(saved.iter().all(|&b| b == n));
    }
    assert_eq!(pair.requester.admitted(), 0);
}

#[tokio::test]
async fn test_missing_file_fails_download() {
    let pair = EnginePair::new(TransferConfig::default()).await;

    let id = pair
        .requester
        .request_download(descriptor("share-1", "owner", "ghost.bin", 10), "/dl/ghost.bin")
        .unwrap();
    let progress = pair.wait_terminal(&id).await;

    assert_eq!(progress.status, TransferStatus::Failed);
    assert!(progress.error.is_some());
    assert_eq!(pair.requester_store.get(Path::new("/dl/ghost.bin")).await, None);
    assert_eq!(pair.requester.admitted(), 0);
}

// ============================================================================
// Admission and cancellation
// ============================================================================

#[tokio::test]
async fn test_admission_cap_is_never_exceeded() {
    let pair = EnginePair::stalled(limited(2)).await;
    let ids: Vec<String> = (0..5)
        .map(|n| {
            pair.requester
                .request_download(
                    descriptor("share-1", "owner", &format!("f{n}"), 1000),
                    format!("/dl/f{n}"),
                )
                .unwrap()
        })
        .collect();

    wait_until("two downloads admitted", TIMEOUT, || {
        count_status(&pair, &ids, TransferStatus::Transferring) == 2
    })
    .await;
    for _ in 0..10 {
        assert!(pair.requester.admitted() <= 2);
        assert_eq!(count_status(&pair, &ids, TransferStatus::Transferring), 2);
        assert_eq!(count_status(&pair, &ids, TransferStatus::Pending), 3);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // drain the queue one cancellation at a time
    for _ in 0..5 {
        let running = ids
            .iter()
            .find(|id| {
                pair.requester
                    .progress(id)
                    .is_some_and(|p| p.status == TransferStatus::Transferring)
            })
            .cloned()
            .unwrap();
        pair.requester.cancel(&running).unwrap();

        let remaining = count_status(&pair, &ids, TransferStatus::Pending)
            + count_status(&pair, &ids, TransferStatus::Transferring);
        wait_until("queue to refill", TIMEOUT, || {
            count_status(&pair, &ids, TransferStatus::Transferring) == remaining.min(2)
        })
        .await;
        assert!(pair.requester.admitted() <= 2);
    }

    assert_eq!(count_status(&pair, &ids, TransferStatus::Cancelled), 5);
    wait_until("slots released", TIMEOUT, || pair.requester.admitted() == 0).await;
}

#[tokio::test]
async fn test_cancel_frees_slot_for_queued_request() {
    let pair = EnginePair::stalled(limited(1)).await;

    pair.requester
        .start_download(
            "transfer-42",
            descriptor("share-1", "owner", "first.bin", 5000),
            "/dl/first.bin",
        )
        .unwrap();
    let requester = &pair.requester;
    wait_until("transfer-42 admitted", TIMEOUT, || {
        requester
            .progress("transfer-42")
            .is_some_and(|p| p.status == TransferStatus::Transferring)
    })
    .await;

    pair.requester
        .start_download(
            "transfer-43",
            descriptor("share-1", "owner", "second.bin", 5000),
            "/dl/second.bin",
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        pair.requester.progress("transfer-43").unwrap().status,
        TransferStatus::Pending
    );

    pair.requester.cancel("transfer-42").unwrap();
    assert_eq!(
        pair.requester.progress("transfer-42").unwrap().status,
        TransferStatus::Cancelled
    );

    wait_until("transfer-43 admitted", TIMEOUT, || {
        requester
            .progress("transfer-43")
            .is_some_and(|p| p.status == TransferStatus::Transferring)
    })
    .await;
    assert_eq!(pair.requester.admitted(), 1);
    assert_eq!(pair.requester_store.get(Path::new("/dl/first.bin")).await, None);
}

#[tokio::test]
async fn test_cancel_unknown_transfer() {
    let pair = EnginePair::stalled(TransferConfig::default()).await;
    assert!(matches!(
        pair.requester.cancel("transfer-missing"),
        Err(Error::TransferNotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_rejects_new_downloads() {
    let pair = EnginePair::stalled(limited(1)).await;
    let id = pair
        .requester
        .request_download(descriptor("share-1", "owner", "a.bin", 10), "/dl/a.bin")
        .unwrap();

    pair.requester.shutdown();

    assert!(matches!(
        pair.requester
            .request_download(descriptor("share-1", "owner", "b.bin", 10), "/dl/b.bin"),
        Err(Error::Shutdown(_))
    ));
    let requester = &pair.requester;
    wait_until("running download to stop", TIMEOUT, || {
        requester.progress(&id).is_some_and(|p| p.status.is_terminal())
    })
    .await;
}
