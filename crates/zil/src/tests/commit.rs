//! Commit-pipeline scenarios: packing, batching, splitting, sizing,
//! ordering, and failure fallbacks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::engine::{BlockEngine, IoPriority};
use crate::error::EngineError;
use crate::record::{LrWrite, TxType, WriteState};
use crate::zilog::SyncPolicy;
use crate::{Options, ZIL_MIN_BLKSZ};

use super::helpers::*;

#[test]
fn single_fsync() {
    let h = harness();
    h.warm();

    h.fs.write(&h.zilog, 7, 0, &[0xAB; 4096], true);
    h.zilog.commit(7);

    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 1);
    let (_, lrw, data) = &writes[0];
    assert_eq!(lrw.foid, 7);
    assert_eq!(lrw.length, 4096);
    assert!(data[..4096].iter().all(|&b| b == 0xAB));

    // The header names the chain; the first block carries the advanced
    // seed of a fresh chain.
    let hdr = h.zilog.header();
    assert_eq!(hdr.log.unwrap().cksum.seq, 2);
    let blocks = chain_blocks(&h.zilog);
    for (i, pair) in blocks.windows(2).enumerate() {
        assert_eq!(pair[1].cksum.seq, pair[0].cksum.seq + 1, "link {i}");
        assert_eq!(pair[1].cksum.guid, pair[0].cksum.guid);
    }

    assert_eq!(h.zilog.stats().itx_copied_count.load(Ordering::Relaxed), 1);
}

#[test]
fn batched_fsyncs_pack_into_few_blocks() {
    let h = harness();
    h.warm();

    for i in 0..100 {
        h.fs.write(&h.zilog, 7, i * 512, &[i as u8; 512], true);
    }
    h.zilog.commit(0);

    // All hundred records are on disk, in assignment order.
    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 100);
    for (i, (hdr, lrw, data)) in writes.iter().enumerate() {
        assert_eq!(lrw.foid, 7);
        assert_eq!(lrw.offset as usize, i * 512);
        assert!(data[..512].iter().all(|&b| b == i as u8));
        if i > 0 {
            assert!(hdr.seq > writes[i - 1].0.seq, "record seq must increase");
        }
    }

    // The burst fits a handful of blocks, not one per record.
    let per_block = std::cell::RefCell::new(Vec::<u32>::new());
    h.zilog
        .parse(
            |_, _| {
                per_block.borrow_mut().push(0);
                Ok(())
            },
            |_, lrh, _, _| {
                if lrh.txtype() == Some(TxType::Write) {
                    *per_block.borrow_mut().last_mut().unwrap() += 1;
                }
                Ok(())
            },
            0,
            false,
        )
        .unwrap();
    let carrying = per_block.borrow().iter().filter(|&&n| n > 0).count();
    assert!(carrying <= 2, "expected <= 2 record-carrying blocks, got {carrying}");
}

#[test]
fn write_larger_than_max_log_data_splits() {
    let h = harness();
    h.warm();

    let len = h.zilog.max_log_data(0) + 64;
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    h.fs
        .write_as(&h.zilog, 9, 0, &payload, true, WriteState::NeedCopy);
    h.zilog.commit(9);

    let writes = chain_writes(&h.zilog);
    assert!(writes.len() >= 2, "oversized record must split");
    let mut next_offset = 0;
    let mut total = 0;
    for (_, lrw, data) in &writes {
        assert_eq!(lrw.foid, 9);
        assert_eq!(lrw.offset, next_offset, "fragments must be contiguous");
        assert_eq!(&data[..lrw.length as usize], &payload[lrw.offset as usize..][..lrw.length as usize]);
        next_offset += lrw.length;
        total += lrw.length as usize;
    }
    assert_eq!(total, len);
}

#[test]
fn record_of_exactly_max_log_data_fits_one_block() {
    let h = harness();
    h.warm();

    // Full record (header + payload) exactly fills a maximum block.
    let len = h.zilog.max_log_data(LrWrite::LEN);
    h.fs
        .write_as(&h.zilog, 3, 0, &vec![0x5a; len], true, WriteState::NeedCopy);
    h.zilog.commit(3);

    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 1, "exact fit must not split");
    assert_eq!(writes[0].1.length as usize, len);
}

#[test]
fn burst_sizing_converges() {
    let h = harness();
    h.warm();

    for burst in 0..8 {
        for i in 0..3 {
            h.fs
                .write(&h.zilog, 7, (burst * 3 + i) * 2000, &[7; 2000], true);
        }
        h.zilog.commit(7);
    }

    let blocks = chain_blocks(&h.zilog);
    assert!(blocks.len() >= 4);
    let tail: Vec<u32> = blocks[blocks.len() - 3..].iter().map(|b| b.size).collect();
    assert!(
        tail.windows(2).all(|w| w[0] == w[1]),
        "predictor should settle on one block size: {tail:?}"
    );
    assert_eq!(tail[0] as usize % ZIL_MIN_BLKSZ, 0);
}

#[test]
fn rename_promotes_async_writes_first() {
    // Every rename-family record type must force the renamed object's
    // pending async writes onto the chain ahead of itself.
    for txtype in [
        TxType::Rename,
        TxType::RenameExchange,
        TxType::RenameWhiteout,
    ] {
        let h = harness();
        h.warm();

        h.fs.write(&h.zilog, 7, 0, &[3; 256], false);
        h.fs.rename_as(&h.zilog, 7, txtype);
        h.zilog.commit(0);

        let recs = chain_records(&h.zilog);
        let wpos = recs
            .iter()
            .position(|(hdr, _)| hdr.txtype() == Some(TxType::Write))
            .expect("async write must be promoted and logged");
        let rpos = recs
            .iter()
            .position(|(hdr, _)| hdr.txtype() == Some(txtype))
            .expect("rename must be logged");
        assert!(
            wpos < rpos,
            "{txtype:?}: file data must precede the rename on disk"
        );
    }
}

#[test]
fn allocation_failure_stalls_and_recovers() {
    let mut h = harness();
    h.warm();

    for i in 0..4 {
        h.fs.write(&h.zilog, 7, i * 1024, &[i as u8; 1024], true);
        h.zilog.commit(7);
    }

    h.mem.inject_alloc_failures(1);
    h.fs.write(&h.zilog, 7, 4 * 1024, &[4; 1024], true);
    h.zilog.commit(7);
    h.fs.write(&h.zilog, 7, 5 * 1024, &[5; 1024], true);
    h.zilog.commit(7);

    // The stall pushed everything through the main pool; later commits run
    // on a fresh chain.
    h.fs.write(&h.zilog, 7, 6 * 1024, &[6; 1024], true);
    h.zilog.commit(7);
    assert!(h.zilog.header().log.is_some());

    // No write was lost: the recovered image holds all seven.
    let expected = h.fs.files();
    h.crash_and_reopen();
    h.claim();
    let mut files = h.fs.files();
    h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert_eq!(files, expected);
}

#[test]
fn concurrent_assign_and_commit() {
    let h = harness();
    h.warm();

    let mut threads = Vec::new();
    for t in 0..4u64 {
        let zilog = Arc::clone(&h.zilog);
        let fs = h.fs.clone();
        threads.push(std::thread::spawn(move || {
            for i in 0..25usize {
                fs.write(&zilog, 10 + t, i * 300, &[t as u8; 300], true);
                if i % 5 == 4 {
                    zilog.commit(10 + t);
                }
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    h.zilog.commit(0);

    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 100);
    for pair in writes.windows(2) {
        assert!(pair[0].0.seq < pair[1].0.seq);
    }
}

#[test]
fn slog_gets_sync_priority_for_small_bursts() {
    let h = harness();
    h.warm();

    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    // Every written chain block sits on the log device at sync priority.
    // (The trailing block is allocated but not yet written.)
    let blocks = chain_blocks(&h.zilog);
    let written: Vec<_> = blocks
        .iter()
        .filter(|bp| h.mem.write_priority(bp).is_some())
        .collect();
    assert!(!written.is_empty());
    for bp in written {
        assert!(h.mem.vdev_is_log(bp.vdev));
        assert_eq!(h.mem.write_priority(bp), Some(IoPriority::SyncWrite));
    }
}

#[test]
fn bulk_bursts_are_demoted_to_async_priority() {
    let h = harness_with(
        Options {
            slog_bulk: 0,
            ..Options::default()
        },
        1,
    );
    h.warm();

    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    let blocks = chain_blocks(&h.zilog);
    let carrier = blocks
        .iter()
        .rev()
        .find(|bp| h.mem.write_priority(bp).is_some())
        .unwrap();
    assert_eq!(h.mem.write_priority(carrier), Some(IoPriority::AsyncWrite));
}

#[test]
fn nocacheflush_skips_vdev_flushes() {
    let h = harness_with(
        Options {
            nocacheflush: true,
            ..Options::default()
        },
        1,
    );
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[2; 512], true);
    h.zilog.commit(7);

    assert_eq!(h.mem.flush_count(0), 0);
    assert_eq!(h.mem.flush_count(1), 0);
}

#[test]
fn legacy_layout_roundtrips() {
    let mut h = harness_with(
        Options {
            slim: false,
            ..Options::default()
        },
        1,
    );
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[0xEE; 2048], true);
    h.zilog.commit(7);

    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 1);

    let expected = h.fs.files();
    h.crash_and_reopen();
    h.claim();
    let mut files = h.fs.files();
    h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert_eq!(files, expected);
}

#[test]
fn frozen_pool_always_logs() {
    let h = harness();
    h.mem.set_frozen(true);

    h.fs.write(&h.zilog, 7, 0, &[9; 700], true);
    h.zilog.commit(7);

    // Even with every txg synced, frozen-pool records stay in the chain.
    let writes = chain_writes(&h.zilog);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1.length, 700);
}

#[test]
fn get_data_io_error_falls_back_to_txg_sync() {
    let h = harness();
    h.warm();

    h.fs
        .write_as(&h.zilog, 7, 0, &[4; 10_000], true, WriteState::NeedCopy);
    h.fs.fail_next_get_data(EngineError::Io);
    let before = h.mem.last_synced_txg();
    h.zilog.commit(7);
    assert!(
        h.mem.last_synced_txg() > before,
        "an unreadable payload must force a txg sync"
    );
}

#[test]
fn flush_errors_reach_the_committer() {
    let h = harness();
    h.warm();

    h.mem.inject_flush_failures(1);
    h.fs.write(&h.zilog, 7, 0, &[5; 512], true);
    let before = h.mem.last_synced_txg();
    h.zilog.commit(7);
    assert!(
        h.mem.last_synced_txg() > before,
        "a failed cache flush must force the txg fallback"
    );

    // The log keeps working afterwards.
    h.fs.write(&h.zilog, 7, 1024, &[6; 512], true);
    h.zilog.commit(7);
}

#[test]
fn commit_with_nothing_pending_is_cheap() {
    let h = harness();
    h.zilog.commit(0);
    // Nothing was ever logged, so no chain was created.
    assert!(h.zilog.header().log.is_none());
}

#[test]
fn sync_disabled_skips_the_log() {
    let h = harness();
    h.zilog.set_sync(SyncPolicy::Disabled);
    h.fs.write(&h.zilog, 7, 0, &[1; 128], true);
    h.zilog.commit(7);
    assert!(h.zilog.header().log.is_none());
}

#[test]
fn suspend_blocks_new_chain_growth() {
    let h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.zilog.suspend().unwrap();
    assert!(h.zilog.header().log.is_none(), "suspend destroys the chain");

    // Commits while suspended fall back to the pool.
    h.fs.write(&h.zilog, 7, 1024, &[2; 512], true);
    let before = h.mem.last_synced_txg();
    h.zilog.commit(7);
    assert!(h.mem.last_synced_txg() > before);

    h.zilog.resume();
    h.fs.write(&h.zilog, 7, 2048, &[3; 512], true);
    h.zilog.commit(7);
    assert!(h.zilog.header().log.is_some(), "chain regrows after resume");
}

#[test]
fn suspend_races_with_assign_without_losing_writes() {
    let mut h = harness();
    h.warm();

    let writer = {
        let zilog = Arc::clone(&h.zilog);
        let fs = h.fs.clone();
        std::thread::spawn(move || {
            for i in 0..50usize {
                fs.write(&zilog, 8, i * 100, &[i as u8; 100], true);
                zilog.commit(8);
            }
        })
    };
    h.zilog.suspend().unwrap();
    writer.join().unwrap();
    h.zilog.resume();

    // Every acknowledged write survives the crash, via chain or pool.
    let expected = h.fs.files();
    h.crash_and_reopen();
    h.claim();
    let mut files = h.fs.files();
    h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert_eq!(files, expected);
}
