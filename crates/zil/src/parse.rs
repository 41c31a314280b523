//! Chain walking and the visitors built on it: claim at import, the
//! pre-import readability check, clearing, and freeing/destroying chains.

use log::{debug, warn};
use scopeguard::defer;

use crate::chain::{open_block, BlockPointer, BpTree, HeaderFlags, ZilHeader};
use crate::engine::BlockEngine;
use crate::error::EngineError;
use crate::record::{byteswap_record, LrCloneRange, LrHeader, LrWrite, TxType};
use crate::zilog::{ParseCounts, Zilog};

fn read_hdr(buf: &[u8], swap: bool) -> LrHeader {
    let mut h = LrHeader::decode(buf);
    if swap {
        h.txtype = h.txtype.swap_bytes();
        h.reclen = h.reclen.swap_bytes();
        h.txg = h.txg.swap_bytes();
        h.seq = h.seq.swap_bytes();
    }
    h
}

impl<E: BlockEngine> Zilog<E> {
    /// Walk the on-disk chain from the header, calling `on_block` for every
    /// block and `on_record` for every record (raw bytes plus the block's
    /// byteswap flag).
    ///
    /// The walk ends at a hole, at a checksum mismatch (the ordinary chain
    /// terminator), or past the claimed maximum sequence numbers. Visitor
    /// errors and real I/O errors are surfaced; the counts of the walk are
    /// recorded on the zilog either way.
    pub(crate) fn parse<FB, FR>(
        &self,
        mut on_block: FB,
        mut on_record: FR,
        _claim_txg: u64,
        _decrypt: bool,
    ) -> Result<ParseCounts, EngineError>
    where
        FB: FnMut(&Self, &BlockPointer) -> Result<(), EngineError>,
        FR: FnMut(&Self, &LrHeader, &[u8], bool) -> Result<(), EngineError>,
    {
        let hdr = self.header();
        // Once claimed, walks never run past what claim saw.
        let claimed = hdr.claim_txg != 0;
        let max_blk_seq = if claimed { hdr.claim_blk_seq } else { u64::MAX };
        let max_lr_seq = if claimed && hdr.flags.contains(HeaderFlags::CLAIM_LR_SEQ_VALID) {
            hdr.claim_lr_seq
        } else {
            u64::MAX
        };

        let mut counts = ParseCounts::default();
        let mut error = None;

        let mut next = hdr.log;
        'walk: while let Some(bp) = next {
            if bp.cksum.seq > max_blk_seq {
                break;
            }
            if let Err(e) = on_block(self, &bp) {
                error = Some(e);
                break;
            }
            counts.blk_count += 1;
            counts.max_blk_seq = bp.cksum.seq;

            let data = match self.engine.read_block(&bp) {
                Ok(data) => data,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            let opened = match open_block(&data, &bp) {
                Ok(opened) => opened,
                // Chain breakage and truncation read as checksum failure;
                // that is the end-of-chain signal, not an error.
                Err(EngineError::Checksum) => break,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };

            let records = opened.records;
            let mut off = 0;
            while off + LrHeader::LEN <= records.len() {
                let lrh = read_hdr(&records[off..], opened.byteswap);
                let reclen = lrh.reclen as usize;
                if reclen < LrHeader::LEN || reclen % 8 != 0 || off + reclen > records.len() {
                    // A torn record region ends the walk like a bad block.
                    break 'walk;
                }
                if lrh.seq > max_lr_seq {
                    break 'walk;
                }
                if let Err(e) = on_record(self, &lrh, &records[off..off + reclen], opened.byteswap)
                {
                    error = Some(e);
                    break 'walk;
                }
                counts.lr_count += 1;
                counts.max_lr_seq = lrh.seq;
                off += reclen;
            }

            next = opened.next;
        }

        self.inner.lock().parse = counts;
        match error {
            Some(e) => Err(e),
            None => Ok(counts),
        }
    }

    // ------------------------------------------------------------------
    // Claim (pool import)
    // ------------------------------------------------------------------

    /// Reserve the dataset's chain at import time so the allocator cannot
    /// reuse its blocks before replay decides their fate. A no-op when the
    /// header already carries a claim for this chain.
    pub fn claim(&self, first_txg: u64) -> Result<(), EngineError> {
        let hdr = self.header();

        if self.engine.log_clear_requested()
            || (self.engine.checkpointed() && hdr.claim_txg == 0)
        {
            // The operator or a checkpoint rewind wants this chain gone.
            if hdr.log.is_some() {
                debug!("clearing unclaimed log chain");
                let mut tree = BpTree::new();
                let _ = self.parse(
                    |z, bp| {
                        if tree.insert(bp) {
                            z.engine.free_block(first_txg, bp);
                        }
                        Ok(())
                    },
                    |_, _, _, _| Ok(()),
                    first_txg,
                    false,
                );
            }
            let mut h = self.header.lock();
            *h = ZilHeader::default();
            self.engine.store_header(&h, first_txg);
            return Ok(());
        }

        if hdr.claim_txg != 0 {
            return Ok(());
        }

        let mut tree = BpTree::new();
        let counts = self.parse(
            |z, bp| {
                if !tree.insert(bp) {
                    return Ok(());
                }
                z.engine.claim_block(first_txg, bp)
            },
            |z, lrh, rec, swap| z.claim_log_record(first_txg, lrh, rec, swap),
            first_txg,
            false,
        )?;

        let mut h = self.header.lock();
        h.claim_txg = first_txg;
        h.claim_blk_seq = counts.max_blk_seq;
        h.claim_lr_seq = counts.max_lr_seq;
        h.flags |= HeaderFlags::CLAIM_LR_SEQ_VALID;
        if counts.blk_count > 0 {
            h.flags |= HeaderFlags::REPLAY_NEEDED;
        }
        self.engine.store_header(&h, first_txg);
        debug!(
            "claimed chain: {} blocks, {} records, max seq {}/{}",
            counts.blk_count, counts.lr_count, counts.max_blk_seq, counts.max_lr_seq
        );
        Ok(())
    }

    fn claim_log_record(
        &self,
        first_txg: u64,
        lrh: &LrHeader,
        rec: &[u8],
        swap: bool,
    ) -> Result<(), EngineError> {
        let mut scratch;
        let rec = if swap {
            scratch = rec.to_vec();
            byteswap_record(&mut scratch);
            &scratch[..]
        } else {
            rec
        };
        match lrh.txtype() {
            Some(TxType::Write) if rec.len() >= LrWrite::LEN => {
                let lrw = LrWrite::read(&rec[LrHeader::LEN..]);
                if let Some(bp) = lrw.blkptr {
                    // Indirect payload blocks need the same protection as
                    // the log blocks themselves.
                    self.engine.claim_block(first_txg, &bp)?;
                }
                Ok(())
            }
            Some(TxType::CloneRange)
                if rec.len() >= LrHeader::LEN + LrCloneRange::BASE_BODY_LEN =>
            {
                let lcr = LrCloneRange::read(&rec[LrHeader::LEN..]);
                for bp in &lcr.bps {
                    self.engine.clone_ref_add(first_txg, bp)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Pre-import validation: walk the whole chain without side effects and
    /// surface anything that would make claim fail.
    pub fn check_log_chain(&self) -> Result<(), EngineError> {
        let mut tree = BpTree::new();
        self.parse(
            |_, bp| {
                tree.insert(bp);
                Ok(())
            },
            |_, _, _, _| Ok(()),
            0,
            false,
        )
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Destroy
    // ------------------------------------------------------------------

    /// Free every block of the chain and schedule the header to be zeroed.
    /// With `keep_first`, the first block stays allocated so the next chain
    /// creation does not have to wait for a sync.
    ///
    /// Returns `false` if there was nothing to destroy.
    pub fn destroy(&self, keep_first: bool) -> bool {
        let prev = self.inner.lock().destroy_txg;
        self.engine.txg_wait_synced(prev);

        let hdr = self.header();
        if hdr.log.is_none() && self.inner.lock().lwbs.is_empty() {
            return false;
        }

        let txg = self.engine.txg_hold();
        defer! { self.engine.txg_rele(txg) }
        debug!("destroying log chain in txg {txg} (keep_first={keep_first})");

        // Hold the pipeline out while the chain is torn down: a racing
        // writer must not pack into or issue an lwb being freed.
        let _issuer = self.issuer_guard();
        let mut inner = self.inner.lock();
        inner.destroy_txg = txg;
        inner.keep_first = keep_first;
        if !inner.lwbs.is_empty() {
            // A live, never-claimed chain: its blocks are known in memory.
            debug_assert_eq!(hdr.claim_txg, 0);
            debug_assert!(!keep_first);
            while let Some(lwb) = inner.lwbs.pop_front() {
                if let Some(bp) = lwb.lock().blk {
                    self.engine.free_block(txg, &bp);
                }
            }
            inner.last_lwb_opened = None;
        } else if !keep_first {
            drop(inner);
            self.free_log_chain(txg, hdr.claim_txg);
        }
        true
    }

    fn free_log_chain(&self, txg: u64, claim_txg: u64) {
        let mut tree = BpTree::new();
        let res = self.parse(
            |z, bp| {
                if tree.insert(bp) {
                    z.engine.free_block(txg, bp);
                }
                Ok(())
            },
            |z, lrh, rec, swap| {
                z.free_log_record(txg, claim_txg, lrh, rec, swap);
                Ok(())
            },
            claim_txg,
            false,
        );
        if let Err(e) = res {
            warn!("freeing log chain stopped early: {e}");
        }
    }

    fn free_log_record(&self, txg: u64, claim_txg: u64, lrh: &LrHeader, rec: &[u8], swap: bool) {
        if lrh.txtype() != Some(TxType::Write) || rec.len() < LrWrite::LEN {
            return;
        }
        let mut scratch;
        let rec = if swap {
            scratch = rec.to_vec();
            byteswap_record(&mut scratch);
            &scratch[..]
        } else {
            rec
        };
        let lrw = LrWrite::read(&rec[LrHeader::LEN..]);
        if let Some(bp) = lrw.blkptr {
            // Payload blocks born into the claimed chain go with it.
            if claim_txg == 0 || bp.birth_txg >= claim_txg {
                self.engine.free_block(txg, &bp);
            }
        }
    }
}
