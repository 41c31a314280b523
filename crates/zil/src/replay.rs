//! Replaying a claimed chain against the filesystem after import.
//!
//! Replay dispatch is a plain function table indexed by the one-byte record
//! tag: no virtual dispatch, one replayer per record type, with an
//! out-of-order set whose records may target objects that were removed
//! later in the chain.

use std::sync::Arc;

use log::{debug, warn};

use crate::chain::HeaderFlags;
use crate::engine::BlockEngine;
use crate::error::{EngineError, ReplayError};
use crate::record::{byteswap_record, LrHeader, LrWrite, TxType, TX_MAX_TYPE};
use crate::zilog::Zilog;

/// One replay function: `(arg, record_image, byteswapped) -> result`. For
/// `TX_WRITE` records the indirect payload, if any, follows the record in
/// the image.
pub type ReplayFn<A> = fn(&mut A, &[u8], bool) -> Result<(), EngineError>;

/// Replay dispatch table, indexed by txtype.
pub struct ReplayTable<A> {
    funcs: [Option<ReplayFn<A>>; TX_MAX_TYPE as usize],
}

impl<A> Default for ReplayTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ReplayTable<A> {
    pub fn new() -> ReplayTable<A> {
        ReplayTable {
            funcs: [None; TX_MAX_TYPE as usize],
        }
    }

    pub fn set(&mut self, txtype: TxType, f: ReplayFn<A>) -> &mut Self {
        assert!(txtype != TxType::Commit, "commit records are never on disk");
        self.funcs[txtype as usize] = Some(f);
        self
    }

    fn get(&self, txtype: TxType) -> Option<ReplayFn<A>> {
        self.funcs[txtype as usize]
    }
}

impl<E: BlockEngine> Zilog<E> {
    /// Replay the claimed chain through `table`, then destroy it.
    ///
    /// Returns `Ok(true)` if records were replayed, `Ok(false)` if there was
    /// nothing to replay (the chain, if any, is destroyed regardless). An
    /// invalid record or a twice-failing replay function aborts with an
    /// error and leaves the chain in place.
    pub fn replay<A>(
        self: &Arc<Self>,
        arg: &mut A,
        table: &ReplayTable<A>,
    ) -> Result<bool, ReplayError> {
        let hdr = self.header();
        if self.opts.replay_disable
            || hdr.claim_txg == 0
            || !hdr.flags.contains(HeaderFlags::REPLAY_NEEDED)
        {
            if self.opts.replay_disable {
                warn!("replay disabled; discarding intent log");
            }
            self.destroy(false);
            return Ok(false);
        }

        self.inner.lock().replaying = true;
        let claim_txg = hdr.claim_txg;
        let start_seq = hdr.replay_seq;
        let mut scratch = vec![0u8; 2 * self.opts.max_block_size];
        let mut abort: Option<ReplayError> = None;

        let res = self.parse(
            |_, _| Ok(()),
            |z, lrh, rec, swap| {
                z.replay_log_record(arg, table, claim_txg, start_seq, &mut scratch, &mut abort, lrh, rec, swap)
            },
            claim_txg,
            true,
        );

        if let Some(e) = abort {
            warn!("replay aborted: {e}");
            self.inner.lock().replaying = false;
            return Err(e);
        }
        if let Err(e) = res {
            warn!("replay failed walking the chain: {e}");
            self.inner.lock().replaying = false;
            return Err(ReplayError::Parse(e));
        }

        let counts = self.parse_counts();
        debug!(
            "replayed {} records in {} blocks",
            counts.lr_count, counts.blk_count
        );
        self.destroy(false);
        self.engine.txg_wait_synced(0);
        self.inner.lock().replaying = false;
        Ok(true)
    }

    fn replay_log_record<A>(
        &self,
        arg: &mut A,
        table: &ReplayTable<A>,
        claim_txg: u64,
        start_seq: u64,
        scratch: &mut [u8],
        abort: &mut Option<ReplayError>,
        lrh: &LrHeader,
        rec: &[u8],
        swap: bool,
    ) -> Result<(), EngineError> {
        let done_seq = start_seq.max(self.inner.lock().replayed_seq);
        if lrh.seq <= done_seq {
            return Ok(());
        }
        if lrh.txg < claim_txg {
            // The operation reached the main pool before the crash.
            return Ok(());
        }

        let Some(txtype) = lrh.txtype() else {
            *abort = Some(ReplayError::UnknownTxType {
                txtype: lrh.txtype,
                seq: lrh.seq,
            });
            return Err(EngineError::Checksum);
        };
        let Some(f) = table.get(txtype) else {
            *abort = Some(ReplayError::Unhandled {
                txtype,
                seq: lrh.seq,
            });
            return Err(EngineError::Checksum);
        };

        let reclen = rec.len();
        scratch[..reclen].copy_from_slice(rec);
        if swap {
            byteswap_record(&mut scratch[..reclen]);
        }
        let mut total = reclen;

        if txtype == TxType::Write && reclen == LrWrite::LEN {
            // Indirect write: pull the payload block in behind the record.
            let lrw = LrWrite::read(&scratch[LrHeader::LEN..reclen]);
            if let Some(bp) = lrw.blkptr {
                let data = self.engine.read_block(&bp)?;
                let len = (lrw.length as usize)
                    .min(data.len())
                    .min(scratch.len() - reclen);
                scratch[reclen..reclen + len].copy_from_slice(&data[..len]);
                total += len;
            }
        }

        if txtype.out_of_order() {
            let foid = u64::from_le_bytes(
                scratch[LrHeader::LEN..LrHeader::LEN + 8].try_into().unwrap(),
            );
            if !self.engine.object_exists(foid) {
                return Ok(());
            }
        }

        let mut err = f(arg, &scratch[..total], swap);
        if err.is_err() {
            // Pending removes of reused object ids may not have settled
            // yet; give the pool a chance and try once more.
            self.engine.txg_wait_synced(0);
            err = f(arg, &scratch[..total], false);
        }
        match err {
            Ok(()) => {
                self.inner.lock().replayed_seq = lrh.seq;
                Ok(())
            }
            Err(e) => {
                *abort = Some(ReplayError::Dispatch {
                    txtype,
                    seq: lrh.seq,
                    source: e,
                });
                Err(e)
            }
        }
    }
}
