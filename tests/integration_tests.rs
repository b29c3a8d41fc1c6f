//! Integration tests for the buffer pool, write-ahead log and crash recovery.

use std::path::Path;
use std::sync::Arc;

use ruzu_storage::storage::{
    BufferPool, LogReader, LogStore, LogTail, PageStore, RecoveryManager, RecoveryOutcome,
    WalConfig, WalManager,
};
use ruzu_storage::{EngineConfig, StorageEngine, PAGE_SIZE};

/// Engine settings with a small pool and no background flusher.
fn small_config(frames: usize) -> EngineConfig {
    EngineConfig {
        buffer_pool_size: frames * PAGE_SIZE,
        flush_interval: None,
        ..EngineConfig::default()
    }
}

/// Opens the log and the pool in `dir` and runs recovery, as the engine does.
fn open_components(dir: &Path, frames: usize) -> (Arc<WalManager>, Arc<BufferPool>, RecoveryOutcome) {
    let wal_path = dir.join("wal.log");
    let scan = LogReader::open(&wal_path).scan().expect("scan log");
    let mut store = LogStore::open(&wal_path).expect("open log store");
    if let LogTail::Torn { offset, .. } = scan.tail {
        store.truncate_to(offset).expect("truncate torn tail");
    }
    let wal = Arc::new(
        WalManager::start(store, scan.next_lsn(), WalConfig::default()).expect("start wal"),
    );
    let pages = PageStore::open(&dir.join("data.ruzu")).expect("open page store");
    let pool = Arc::new(BufferPool::new(frames, pages, wal.clone()).expect("create pool"));
    let outcome = RecoveryManager::new(&pool, &wal)
        .recover(&scan)
        .expect("recover");
    (wal, pool, outcome)
}

// =============================================================================
// Buffer Pool Integration Tests
// =============================================================================

mod buffer_pool_integration {
    use super::*;
    use ruzu_storage::storage::{LogPayload, PageId, PAGE_HEADER_SIZE};
    use ruzu_storage::StorageError;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_pool_exhausted_until_unpin() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (_wal, pool, _) = open_components(temp_dir.path(), 2);

        let a = pool.allocate_page().expect("allocate a");
        let b = pool.allocate_page().expect("allocate b");
        let c = pool.allocate_page().expect("allocate c");

        let frame_a = pool.fetch_page(a).expect("fetch a");
        let frame_b = pool.fetch_page(b).expect("fetch b");

        // Every frame pinned: fail immediately, never block
        assert!(matches!(
            pool.fetch_page(c),
            Err(StorageError::PoolExhausted { capacity: 2 })
        ));

        frame_a.unpin(false).expect("unpin a");
        let frame_c = pool.fetch_page(c).expect("fetch c after unpin");
        assert!(!pool.contains(a), "a was the only unpinned frame");
        assert!(pool.contains(b));
        assert_eq!(pool.stats().evictions, 1);

        frame_b.unpin(false).expect("unpin b");
        frame_c.unpin(false).expect("unpin c");
    }

    #[test]
    fn test_unpin_with_zero_pin_count_fails() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (_wal, pool, _) = open_components(temp_dir.path(), 4);
        let page_id = pool.allocate_page().expect("allocate");

        pool.fetch_page(page_id)
            .expect("fetch")
            .unpin(false)
            .expect("first unpin");
        assert!(matches!(
            pool.unpin_page(page_id, false),
            Err(StorageError::NotPinned(id)) if id == page_id
        ));
    }

    #[test]
    fn test_flush_page_forces_log_first() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (wal, pool, _) = open_components(temp_dir.path(), 4);
        let page_id = pool.allocate_page().expect("allocate");

        let lsn = {
            let handle = pool.pin(page_id).expect("pin");
            let mut page = handle.write();
            let payload = LogPayload::update(page_id, PAGE_HEADER_SIZE, vec![0], vec![7])
                .expect("build update");
            let lsn = wal.append(1, payload).expect("append");
            page.write_range(PAGE_HEADER_SIZE, &[7]).expect("write");
            page.set_lsn(lsn);
            lsn
        };
        assert!(wal.durable_lsn() < lsn);

        pool.flush_page(page_id).expect("flush page");
        assert!(wal.durable_lsn() >= lsn, "log must be durable before the page write");
        assert!(!pool.has_dirty_pages());
    }

    #[test]
    fn test_dirty_eviction_forces_log_first() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (wal, pool, _) = open_components(temp_dir.path(), 2);
        let pages: Vec<PageId> = (0..3)
            .map(|_| pool.allocate_page().expect("allocate"))
            .collect();

        let mut last = 0;
        for &page_id in &pages[..2] {
            let handle = pool.pin(page_id).expect("pin");
            let mut page = handle.write();
            let payload = LogPayload::update(page_id, PAGE_HEADER_SIZE, vec![0], vec![1])
                .expect("build update");
            last = wal.append(1, payload).expect("append");
            page.write_range(PAGE_HEADER_SIZE, &[1]).expect("write");
            page.set_lsn(last);
        }
        assert_eq!(wal.durable_lsn(), 0);

        // Loading a third page evicts a dirty one
        drop(pool.pin(pages[2]).expect("pin third"));
        assert!(wal.durable_lsn() >= last - 1);
        assert_eq!(pool.stats().pages_flushed, 1);
    }

    #[test]
    fn test_background_flusher_cleans_pages() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let config = EngineConfig {
            flush_interval: Some(Duration::from_millis(10)),
            ..small_config(8)
        };
        let engine = StorageEngine::open(temp_dir.path(), config).expect("open engine");
        let page_id = engine.allocate_page().expect("allocate");

        let txn = engine.begin().expect("begin");
        engine
            .write(txn, page_id, PAGE_HEADER_SIZE, b"flushed")
            .expect("write");
        engine.commit(txn).expect("commit");

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.pool().has_dirty_pages() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.pool().has_dirty_pages());
        // Never evicts
        assert!(engine.pool().contains(page_id));
    }
}

// =============================================================================
// WAL Integration Tests
// =============================================================================

mod wal_integration {
    use super::*;
    use ruzu_storage::storage::LogPayload;
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_concurrent_appends_batch_syncs() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store = LogStore::open(&temp_dir.path().join("wal.log")).expect("open log store");
        let config = WalConfig {
            group_commit_window: Duration::from_millis(20),
            ..WalConfig::default()
        };
        let wal = Arc::new(WalManager::start(store, 1, config).expect("start wal"));
        let start = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10u64)
            .map(|thread_id| {
                let wal = Arc::clone(&wal);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    for i in 0..10u64 {
                        let txn = thread_id * 100 + i + 1;
                        let lsn = wal.append(txn, LogPayload::Commit).expect("append");
                        wal.flush_up_to(lsn).expect("flush");
                        assert!(wal.durable_lsn() >= lsn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let stats = wal.stats();
        assert_eq!(stats.records_appended, 100);
        assert_eq!(stats.durable_lsn, 100);
        // Committers waiting in the same window share one sync
        assert!(
            stats.sync_calls < 100,
            "expected batched syncs for 100 commits, got {}",
            stats.sync_calls
        );
    }

    #[test]
    fn test_lsns_continue_across_restart() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let last = {
            let (wal, _pool, _) = open_components(temp_dir.path(), 4);
            wal.append(1, LogPayload::Begin).expect("append");
            let last = wal.append(1, LogPayload::Commit).expect("append");
            wal.close().expect("close wal");
            last
        };

        let (wal, _pool, _) = open_components(temp_dir.path(), 4);
        assert_eq!(wal.next_lsn(), last + 1);
        assert!(wal.append(2, LogPayload::Begin).expect("append") > last);
    }
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

mod crash_recovery_tests {
    use super::*;
    use ruzu_storage::storage::{LogPayload, PageId, PAGE_HEADER_SIZE};
    use ruzu_storage::StorageError;
    use tempfile::TempDir;

    const OFFSET: usize = PAGE_HEADER_SIZE;

    fn read(engine: &StorageEngine, page_id: PageId, len: usize) -> Vec<u8> {
        engine.read(page_id, OFFSET, len).expect("read")
    }

    // -------------------------------------------------------------------------
    // Logged update flushed to disk survives a kill
    // -------------------------------------------------------------------------

    #[test]
    fn test_flushed_update_survives_kill() {
        let temp_dir = TempDir::new().expect("create temp dir");
        {
            let (wal, pool, _) = open_components(temp_dir.path(), 4);
            let page_id = pool.allocate_page().expect("allocate");
            assert_eq!(page_id, PageId::new(0));

            // LSNs 1-4
            wal.append(1, LogPayload::Begin).expect("begin");
            wal.append(2, LogPayload::Begin).expect("begin");
            wal.append(2, LogPayload::Commit).expect("commit");
            wal.append(3, LogPayload::Begin).expect("begin");

            let lsn = {
                let handle = pool.pin(page_id).expect("pin");
                let mut page = handle.write();
                let payload =
                    LogPayload::update(page_id, OFFSET, vec![0, 0, 0], vec![1, 2, 3])
                        .expect("build update");
                let lsn = wal.append(1, payload).expect("append update");
                page.write_range(OFFSET, &[1, 2, 3]).expect("write");
                page.set_lsn(lsn);
                lsn
            };
            assert_eq!(lsn, 5);

            wal.flush_up_to(5).expect("flush log");
            pool.flush_page(page_id).expect("flush page");
            let commit = wal.append(1, LogPayload::Commit).expect("commit");
            wal.flush_up_to(commit).expect("flush commit");

            // Kill: stop the log, drop the pool without flushing
            wal.stop();
        }

        let (_wal, pool, outcome) = open_components(temp_dir.path(), 4);
        let report = outcome.report().expect("recovered");
        assert_eq!(report.losers, vec![3]);
        // The page on disk already carries LSN 5
        assert_eq!(report.redo_applied, 0);

        let handle = pool.pin(PageId::new(0)).expect("pin");
        let page = handle.read();
        assert_eq!(page.read_range(OFFSET, 3).expect("read"), &[1, 2, 3]);
        assert_eq!(page.lsn(), 5);
    }

    // -------------------------------------------------------------------------
    // Uncommitted update is undone
    // -------------------------------------------------------------------------

    #[test]
    fn test_uncommitted_update_undone_after_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (page_id, loser) = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");

            let setup = engine.begin().expect("begin");
            engine.write(setup, page_id, OFFSET, b"before").expect("write");
            engine.commit(setup).expect("commit");

            let loser = engine.begin().expect("begin");
            engine.write(loser, page_id, OFFSET, b"during").expect("write");
            // The uncommitted bytes reach disk
            engine.pool().flush_all().expect("flush all");
            engine.kill();
            (page_id, loser)
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert_eq!(report.losers, vec![loser]);
        assert_eq!(report.clrs_written, 1);
        assert_eq!(read(&engine, page_id, 6), b"before");
    }

    #[test]
    fn test_committed_data_survives_kill_without_page_flush() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"durable").expect("write");
            engine.commit(txn).expect("commit");
            engine.kill();
            page_id
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert!(report.redo_applied >= 1);
        assert_eq!(read(&engine, page_id, 7), b"durable");
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let winner = engine.begin().expect("begin");
            engine.write(winner, page_id, OFFSET, b"keep").expect("write");
            engine.commit(winner).expect("commit");

            let loser = engine.begin().expect("begin");
            engine.write(loser, page_id, OFFSET, b"drop").expect("write");
            engine.wal().flush_all().expect("flush log");
            engine.kill();
            page_id
        };

        let first_log_size = {
            let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
            assert_eq!(read(&engine, page_id, 4), b"keep");
            let size = engine.wal().log_size();
            engine.kill();
            size
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen twice");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert!(report.losers.is_empty());
        assert_eq!(report.clrs_written, 0);
        assert_eq!(engine.wal().log_size(), first_log_size);
        assert_eq!(read(&engine, page_id, 4), b"keep");
    }

    #[test]
    fn test_torn_tail_recovered_with_loss() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let wal_path = temp_dir.path().join("wal.log");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"safe").expect("write");
            engine.commit(txn).expect("commit");
            engine.kill();
            page_id
        };

        // A frame header promising more bytes than were written
        let valid_len = std::fs::metadata(&wal_path).expect("metadata").len();
        let mut bytes = std::fs::read(&wal_path).expect("read log");
        bytes.extend_from_slice(&[200, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 1, 2, 3]);
        std::fs::write(&wal_path, &bytes).expect("write log");

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        match engine.recovery_outcome() {
            RecoveryOutcome::RecoveredWithLoss(report, loss) => {
                assert_eq!(report.records_scanned, 3);
                assert_eq!(loss.offset, valid_len);
                assert_eq!(loss.discarded_bytes, 11);
            }
            other => panic!("expected RecoveredWithLoss, got {other:?}"),
        }
        assert_eq!(read(&engine, page_id, 4), b"safe");
        assert!(!LogReader::open(&wal_path).scan().expect("scan").is_corrupt());
    }

    #[test]
    fn test_mid_log_corruption_refuses_open() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let wal_path = temp_dir.path().join("wal.log");
        {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            for value in [b"one", b"two"] {
                let txn = engine.begin().expect("begin");
                engine.write(txn, page_id, OFFSET, value).expect("write");
                engine.commit(txn).expect("commit");
            }
            engine.kill();
        }

        // Damage the body of the first frame; later frames still verify
        let mut bytes = std::fs::read(&wal_path).expect("read log");
        let first_body = ruzu_storage::storage::wal::LOG_HEADER_SIZE
            + ruzu_storage::storage::wal::FRAME_HEADER_SIZE;
        bytes[first_body + 1] ^= 0xFF;
        std::fs::write(&wal_path, &bytes).expect("write log");
        let data_before = std::fs::read(temp_dir.path().join("data.ruzu")).expect("read data");

        match StorageEngine::open(temp_dir.path(), small_config(4)) {
            Err(StorageError::FatalCorruption { offset, .. }) => {
                assert_eq!(offset, ruzu_storage::storage::wal::LOG_HEADER_SIZE as u64);
            }
            Err(other) => panic!("expected FatalCorruption, got {other}"),
            Ok(_) => panic!("expected FatalCorruption, engine opened"),
        }

        // Nothing was touched
        assert_eq!(std::fs::read(&wal_path).expect("read log"), bytes);
        assert_eq!(
            std::fs::read(temp_dir.path().join("data.ruzu")).expect("read data"),
            data_before
        );
    }

    #[test]
    fn test_checkpoint_with_running_transaction_then_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let pages = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let pages: Vec<PageId> = (0..3)
                .map(|_| engine.allocate_page().expect("allocate"))
                .collect();

            let t1 = engine.begin().expect("begin");
            engine.write(t1, pages[0], OFFSET, b"AAAA").expect("write");
            engine.commit(t1).expect("commit");

            let t2 = engine.begin().expect("begin");
            engine.write(t2, pages[1], OFFSET, b"BBBB").expect("write");

            let summary = engine.checkpoint().expect("checkpoint");
            assert!(!summary.log_truncated, "t2 is still running");

            // Page 1 dirtied again after the checkpoint by the loser
            engine.write(t2, pages[1], OFFSET + 4, b"bb").expect("write");

            let t3 = engine.begin().expect("begin");
            engine.write(t3, pages[2], OFFSET, b"CCCC").expect("write");
            engine.commit(t3).expect("commit");
            engine.kill();
            pages
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert!(report.checkpoint_lsn.is_some());
        assert_eq!(report.losers.len(), 1);
        assert_eq!(report.clrs_written, 2);

        assert_eq!(read(&engine, pages[0], 4), b"AAAA");
        assert_eq!(read(&engine, pages[1], 6), [0u8; 6]);
        assert_eq!(read(&engine, pages[2], 4), b"CCCC");
    }

    #[test]
    fn test_quiescent_checkpoint_truncates_log() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let wal_path = temp_dir.path().join("wal.log");
        let (page_id, checkpoint_lsn) = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"kept").expect("write");
            engine.commit(txn).expect("commit");

            let summary = engine.checkpoint().expect("checkpoint");
            assert!(summary.log_truncated);
            assert_eq!(
                std::fs::metadata(&wal_path).expect("metadata").len(),
                ruzu_storage::storage::wal::LOG_HEADER_SIZE as u64
            );
            engine.kill();
            (page_id, summary.lsn)
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        assert_eq!(read(&engine, page_id, 4), b"kept");
        assert!(engine.wal().next_lsn() > checkpoint_lsn);
    }

    #[test]
    fn test_interrupted_log_reset_keeps_database_usable() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let temp_log = temp_dir.path().join("wal.log.tmp");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"reset").expect("write");
            let commit = engine.commit(txn).expect("commit");
            engine.kill();

            // A shutdown checkpoint built the new header but crashed before
            // swapping it in
            let header = ruzu_storage::storage::LogHeader::new(commit + 2);
            std::fs::write(&temp_log, header.encode()).expect("write temp log");
            page_id
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert_eq!(report.records_scanned, 3);
        assert_eq!(read(&engine, page_id, 5), b"reset");
        assert!(!temp_log.exists());

        // The next clean shutdown truncates and reopens normally
        engine.close().expect("close");
        drop(engine);
        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen again");
        assert!(matches!(engine.recovery_outcome(), RecoveryOutcome::Clean(_)));
        assert_eq!(read(&engine, page_id, 5), b"reset");
    }

    #[test]
    fn test_runtime_abort_survives_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"gone").expect("write");
            engine.abort(txn).expect("abort");
            engine.kill();
            page_id
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        let report = engine.recovery_outcome().report().expect("recovered");
        assert!(report.losers.is_empty(), "abort record ends the transaction");
        assert_eq!(read(&engine, page_id, 4), [0u8; 4]);
    }

    #[test]
    fn test_close_then_reopen_is_clean() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let page_id = {
            let engine =
                StorageEngine::open(temp_dir.path(), small_config(4)).expect("open engine");
            let page_id = engine.allocate_page().expect("allocate");
            let txn = engine.begin().expect("begin");
            engine.write(txn, page_id, OFFSET, b"closed").expect("write");
            engine.commit(txn).expect("commit");
            engine.close().expect("close");
            page_id
        };

        let engine = StorageEngine::open(temp_dir.path(), small_config(4)).expect("reopen");
        match engine.recovery_outcome() {
            RecoveryOutcome::Clean(report) => {
                assert_eq!(report.records_scanned, 0);
                assert!(report.losers.is_empty());
            }
            other => panic!("expected a clean recovery, got {other:?}"),
        }
        assert_eq!(read(&engine, page_id, 6), b"closed");
    }

    // -------------------------------------------------------------------------
    // Property-based tests
    // -------------------------------------------------------------------------

    mod proptest_durability {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashMap;

        const PAGES: u32 = 6;

        #[derive(Debug, Clone, Copy)]
        enum Outcome {
            Commit,
            Abort,
        }

        #[derive(Debug, Clone)]
        enum Step {
            /// Writes `(page, slot, value)` triples, then ends the transaction.
            Txn(Vec<(u32, usize, u8)>, Outcome),
            Checkpoint,
        }

        fn write_strategy() -> impl Strategy<Value = (u32, usize, u8)> {
            (0..PAGES, 0..32usize, 1..=255u8)
        }

        fn step_strategy() -> impl Strategy<Value = Step> {
            prop_oneof![
                4 => (
                    proptest::collection::vec(write_strategy(), 1..4),
                    prop_oneof![Just(Outcome::Commit), Just(Outcome::Abort)],
                )
                    .prop_map(|(writes, outcome)| Step::Txn(writes, outcome)),
                1 => Just(Step::Checkpoint),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            /// Property: after a kill, exactly the committed writes are visible
            #[test]
            fn test_committed_writes_survive_kill(
                steps in proptest::collection::vec(step_strategy(), 1..12),
                pending in proptest::collection::vec(write_strategy(), 0..4),
            ) {
                let temp_dir = TempDir::new().expect("create temp dir");
                let mut expected: HashMap<(u32, usize), u8> = HashMap::new();

                {
                    let engine = StorageEngine::open(temp_dir.path(), small_config(3))
                        .expect("open engine");
                    for _ in 0..PAGES {
                        engine.allocate_page().expect("allocate");
                    }

                    for step in &steps {
                        match step {
                            Step::Checkpoint => {
                                engine.checkpoint().expect("checkpoint");
                            }
                            Step::Txn(writes, outcome) => {
                                let txn = engine.begin().expect("begin");
                                for &(page, slot, value) in writes {
                                    engine
                                        .write(txn, PageId::new(page), OFFSET + slot, &[value])
                                        .expect("write");
                                }
                                match outcome {
                                    Outcome::Commit => {
                                        engine.commit(txn).expect("commit");
                                        for &(page, slot, value) in writes {
                                            expected.insert((page, slot), value);
                                        }
                                    }
                                    Outcome::Abort => {
                                        engine.abort(txn).expect("abort");
                                    }
                                }
                            }
                        }
                    }

                    // A transaction still running at the crash
                    if !pending.is_empty() {
                        let txn = engine.begin().expect("begin");
                        for &(page, slot, value) in &pending {
                            engine
                                .write(txn, PageId::new(page), OFFSET + slot, &[value])
                                .expect("write");
                        }
                        engine.wal().flush_all().expect("flush log");
                    }
                    engine.kill();
                }

                let engine = StorageEngine::open(temp_dir.path(), small_config(3))
                    .expect("reopen");
                prop_assert!(engine.recovery_outcome().report().is_some());
                for page in 0..PAGES {
                    let bytes = engine
                        .read(PageId::new(page), OFFSET, 32)
                        .expect("read");
                    for (slot, &byte) in bytes.iter().enumerate() {
                        let want = expected.get(&(page, slot)).copied().unwrap_or(0);
                        prop_assert_eq!(byte, want, "page {} slot {}", page, slot);
                    }
                }
            }
        }
    }

    mod proptest_eviction {
        use super::*;
        use proptest::prelude::*;
        use ruzu_storage::storage::FrameRef;

        const CAPACITY: usize = 4;
        const PAGES: u32 = 10;

        #[derive(Debug, Clone)]
        enum Op {
            Fetch(u32),
            Unpin(usize, bool),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..PAGES).prop_map(Op::Fetch),
                (0..CAPACITY * 2, any::<bool>()).prop_map(|(idx, dirty)| Op::Unpin(idx, dirty)),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Property: a pinned page is never evicted or replaced
            #[test]
            fn test_pinned_pages_never_evicted(ops in proptest::collection::vec(op_strategy(), 1..80)) {
                let temp_dir = TempDir::new().expect("create temp dir");
                let (_wal, pool, _) = open_components(temp_dir.path(), CAPACITY);
                for _ in 0..PAGES {
                    pool.allocate_page().expect("allocate");
                }

                let mut held: Vec<FrameRef<'_>> = Vec::new();
                for op in ops {
                    match op {
                        Op::Fetch(page) => {
                            let page_id = PageId::new(page);
                            let mut distinct: Vec<PageId> = held.iter().map(FrameRef::page_id).collect();
                            distinct.sort();
                            distinct.dedup();
                            let must_fit = distinct.len() < CAPACITY || distinct.contains(&page_id);

                            match pool.fetch_page(page_id) {
                                Ok(frame) => held.push(frame),
                                Err(StorageError::PoolExhausted { .. }) => {
                                    prop_assert!(!must_fit, "exhausted with an unpinned frame available");
                                }
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                        Op::Unpin(idx, dirty) => {
                            if !held.is_empty() {
                                let frame = held.remove(idx % held.len());
                                frame.unpin(dirty).expect("unpin");
                            }
                        }
                    }

                    for frame in &held {
                        prop_assert!(pool.contains(frame.page_id()));
                        prop_assert_eq!(frame.read().id, frame.page_id());
                        let holds = held.iter().filter(|f| f.page_id() == frame.page_id()).count();
                        prop_assert!(pool.pin_count(frame.page_id()).unwrap_or(0) as usize >= holds);
                    }
                }

                for frame in held {
                    frame.unpin(false).expect("unpin");
                }
            }
        }
    }
}
