//! Crash, claim, and replay scenarios: the on-disk chain outliving the
//! process and being turned back into filesystem state.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::chain::{seal_block, BlockPointer, ChainChecksum, HeaderFlags, ZilHeader, TRAILER_LEN};
use crate::engine::{BlockEngine, IoPriority, Memory};
use crate::error::ReplayError;
use crate::record::{LrCloneRange, LrHeader, TxType};
use crate::zilog::Zilog;
use crate::Options;

use super::helpers::*;

#[test]
fn replay_after_crash_restores_acknowledged_writes() {
    let mut h = harness();
    h.warm();

    h.fs.write(&h.zilog, 7, 0, &[0xA1; 1500], true);
    h.zilog.commit(7);
    h.fs.write(&h.zilog, 8, 0, &[0xB2; 900], true);
    h.zilog.commit(8);
    h.fs.write(&h.zilog, 7, 1500, &[0xC3; 600], true);
    h.zilog.commit(7);

    let expected = h.fs.files();
    h.crash_and_reopen();

    // The crash reverted everything that only lived in the commit pipeline.
    assert_ne!(h.fs.files(), expected);

    h.claim();
    let hdr = h.zilog.header();
    assert_ne!(hdr.claim_txg, 0);
    assert!(hdr.flags.contains(HeaderFlags::REPLAY_NEEDED));
    assert!(hdr.flags.contains(HeaderFlags::CLAIM_LR_SEQ_VALID));

    let mut files = h.fs.files();
    let replayed = h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert!(replayed);
    assert_eq!(files, expected);

    // Replay consumed the chain.
    h.mem.txg_wait_synced(0);
    assert!(h.zilog.header().log.is_none());
}

#[test]
fn claim_is_idempotent() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.claim();
    let first = h.zilog.header();
    h.claim();
    assert_eq!(h.zilog.header(), first);
}

#[test]
fn claim_reserves_log_and_data_blocks() {
    let mut h = harness();
    h.warm();

    // An indirect write puts its payload in the main pool; claim must
    // reserve both the log block and the payload block.
    let big = vec![0x77; 40 * 1024];
    h.fs.write(&h.zilog, 7, 0, &big, true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.claim();

    let writes = chain_writes(&h.zilog);
    let indirect = writes
        .iter()
        .find_map(|(_, lrw, _)| lrw.blkptr)
        .expect("an indirect write record with a payload pointer");
    assert!(h.mem.is_claimed(&indirect));

    let mut files = h.fs.files();
    h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert_eq!(files.get(&7).map(|f| f.len()), Some(big.len()));
    assert_eq!(files[&7], big);
}

#[test]
fn parse_reads_exactly_the_records_before_corruption() {
    let mut h = harness();
    h.warm();
    for i in 0..3 {
        h.fs.write(&h.zilog, 7, i * 512, &[i as u8; 512], true);
        h.zilog.commit(7);
    }
    let intact = chain_records(&h.zilog).len();
    let blocks = chain_blocks(&h.zilog);
    assert!(blocks.len() >= 3);

    // Corrupt the stored next-block pointer of the second block: the walk
    // must end there, with everything before it intact.
    h.crash_and_reopen();
    h.mem.corrupt_block(&blocks[1], 16 + 10);

    let records = chain_records(&h.zilog);
    assert!(records.len() < intact);

    // Re-walk the unbroken prefix: block 0's records are all there.
    let seen_blocks = std::cell::Cell::new(0usize);
    let first_block_records = std::cell::Cell::new(0usize);
    h.zilog
        .parse(
            |_, _| {
                seen_blocks.set(seen_blocks.get() + 1);
                Ok(())
            },
            |_, _, _, _| {
                if seen_blocks.get() <= 1 {
                    first_block_records.set(first_block_records.get() + 1);
                }
                Ok(())
            },
            0,
            false,
        )
        .unwrap();
    assert!(records.len() >= first_block_records.get());
}

#[test]
fn replay_skips_records_for_missing_objects() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 9, 0, &[9; 256], true);
    h.zilog.commit(9);

    h.crash_and_reopen();
    h.claim();
    // Object 9 no longer exists; its write is out-of-order-skippable.
    h.mem.set_live_objects([1u64]);

    let mut files = Files::new();
    h.zilog.replay(&mut files, &replay_table()).unwrap();
    assert!(!files.contains_key(&9));
}

#[test]
fn replay_disable_discards_the_chain() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.claim();

    let opts = Options {
        replay_disable: true,
        ..*h.zilog.options()
    };
    let zilog = Zilog::with_options(Arc::clone(&h.mem), h.fs.clone(), opts);
    let mut files = Files::new();
    let replayed = zilog.replay(&mut files, &replay_table()).unwrap();
    assert!(!replayed);
    assert!(files.is_empty());
}

#[test]
fn unknown_record_type_aborts_replay_and_keeps_the_chain() {
    enable_logging();
    let mem = Arc::new(Memory::new(54, 1, 0));
    let fs = TestFs::new((*mem).clone());

    // Hand-craft a single-block chain whose record has a bogus type.
    let txg = mem.current_open_txg();
    let mut bp = mem.alloc_log_block(txg, 4096, None, false).unwrap();
    bp.cksum = ChainChecksum {
        guid: [11, 22],
        objset: 54,
        seq: 2,
    };
    bp.slim = true;

    let mut buf = vec![0u8; 4096];
    let rec = LrHeader {
        txtype: 77,
        reclen: LrHeader::LEN as u64,
        txg,
        seq: 1,
    };
    rec.encode_into(&mut buf[TRAILER_LEN..]);
    seal_block(&mut buf, true, LrHeader::LEN, None, bp.cksum);
    mem.write_block(&bp, &buf, IoPriority::SyncWrite).unwrap();
    mem.flush_vdev(bp.vdev).unwrap();
    mem.store_header(
        &ZilHeader {
            log: Some(bp),
            ..ZilHeader::default()
        },
        txg,
    );

    let zilog = Zilog::open(Arc::clone(&mem), fs);
    zilog.claim(mem.current_open_txg()).unwrap();

    let mut files = Files::new();
    let err = zilog.replay(&mut files, &replay_table()).unwrap_err();
    assert!(matches!(err, ReplayError::UnknownTxType { txtype: 77, .. }));
    // The chain survives an aborted replay.
    assert!(zilog.header().log.is_some());
}

#[test]
fn claim_registers_clone_range_references() {
    enable_logging();
    let mem = Arc::new(Memory::new(54, 1, 0));
    let fs = TestFs::new((*mem).clone());

    let txg = mem.current_open_txg();
    let data_a = mem.put_data_block(txg, &[1; 4096]);
    let data_b = mem.put_data_block(txg, &[2; 4096]);

    let mut bp = mem.alloc_log_block(txg, 4096, None, false).unwrap();
    bp.cksum = ChainChecksum {
        guid: [5, 6],
        objset: 54,
        seq: 2,
    };
    bp.slim = true;

    let lcr = LrCloneRange {
        foid: 7,
        offset: 0,
        length: 8192,
        blksz: 4096,
        bps: vec![data_a, data_b],
    };
    let body_len = LrCloneRange::encoded_body_len(2);
    let rec = LrHeader {
        txtype: TxType::CloneRange as u64,
        reclen: (LrHeader::LEN + body_len) as u64,
        txg,
        seq: 1,
    };
    let mut buf = vec![0u8; 4096];
    rec.encode_into(&mut buf[TRAILER_LEN..]);
    lcr.write_into(&mut buf[TRAILER_LEN + LrHeader::LEN..]);
    seal_block(&mut buf, true, rec.reclen as usize, None, bp.cksum);
    mem.write_block(&bp, &buf, IoPriority::SyncWrite).unwrap();
    mem.flush_vdev(bp.vdev).unwrap();
    mem.store_header(
        &ZilHeader {
            log: Some(bp),
            ..ZilHeader::default()
        },
        txg,
    );

    let zilog = Zilog::open(Arc::clone(&mem), fs);
    zilog.claim(mem.current_open_txg()).unwrap();
    assert_eq!(mem.clone_ref_count(), 2);
}

#[test]
fn log_clear_discards_unclaimed_chains() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.mem.set_log_clear(true);
    h.claim();

    let hdr = h.zilog.header();
    assert_eq!(hdr, ZilHeader::default());
}

#[test]
fn checkpoint_rewind_discards_unclaimed_chains() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.mem.set_checkpointed(true);
    h.claim();
    assert_eq!(h.zilog.header(), ZilHeader::default());
}

#[test]
fn destroy_keep_first_leaves_the_head_block() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    let destroyed = h.zilog.destroy(true);
    assert!(destroyed);
    h.mem.txg_wait_synced(0);

    let hdr = h.zilog.header();
    assert_eq!(hdr.claim_txg, 0);
    assert!(hdr.log.is_some(), "keep_first retains the head block");

    // The next chain creation releases it and starts fresh. The creating
    // commit itself is satisfied by the creation sync; the one after it
    // logs normally.
    h.fs.write(&h.zilog, 7, 0, &[2; 512], true);
    h.zilog.commit(7);
    h.fs.write(&h.zilog, 7, 1024, &[3; 512], true);
    h.zilog.commit(7);
    assert_eq!(chain_writes(&h.zilog).len(), 1);
}

#[test]
fn suspend_refuses_unreplayed_chains() {
    let mut h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.crash_and_reopen();
    h.claim();
    assert!(matches!(
        h.zilog.suspend(),
        Err(crate::error::SuspendError::ReplayNeeded)
    ));
}

#[test]
fn suspend_requires_the_encryption_key() {
    let h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    h.mem.set_encrypted(true, false);
    assert!(matches!(
        h.zilog.suspend(),
        Err(crate::error::SuspendError::KeyUnavailable)
    ));
}

#[test]
fn clean_is_idempotent() {
    let h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 128], true);
    h.zilog.commit(7);

    h.mem.txg_wait_synced(0);
    let synced = h.mem.last_synced_txg();
    h.zilog.clean(synced);
    h.zilog.clean(synced);
}

#[test]
fn sync_frees_completed_blocks() {
    let h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);

    let before: Vec<BlockPointer> = chain_blocks(&h.zilog);
    assert!(!before.is_empty());

    h.mem.txg_wait_synced(0);
    // Flushed blocks whose txgs synced were freed and unlinked; at most
    // the still-open tail remains reachable.
    let after = chain_records(&h.zilog);
    assert!(after.is_empty());
}

#[test]
fn close_drains_and_tears_down() {
    let h = harness();
    h.warm();
    h.fs.write(&h.zilog, 7, 0, &[1; 512], true);
    h.zilog.commit(7);
    h.zilog.close();
}
