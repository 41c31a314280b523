//! Per-dataset intent log controller: itx staging, the writer pipeline that
//! packs itxs into chained log write blocks, and the txg-driven
//! reclamation, destroy, and suspend paths.
//!
//! The pipeline runs under a single issuer lock per zilog, so at most one
//! thread is closing, allocating, or issuing lwbs at a time. Producers keep
//! assigning itxs into per-txg slots concurrently; they never take the
//! issuer lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use scopeguard::defer;

use crate::chain::{seal_block, BlockPointer, ChainChecksum, ZilHeader, TRAILER_LEN};
use crate::engine::{BlockEngine, GetData, Io, IoPriority, IoRuntime};
use crate::error::{EngineError, SuspendError};
use crate::itxg::{Cleaner, ItxgSlot};
use crate::lwb::{Lwb, LwbState};
use crate::record::{p2roundup, Itx, LrHeader, LrWrite, TxType, WriteState};
use crate::waiter::CommitWaiter;
use crate::{Options, TXG_CONCURRENT_STATES, TXG_SIZE, ZILTEST_TXG, ZIL_BURSTS, ZIL_MIN_BLKSZ};

/// When the dataset wants its operations made durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPolicy {
    /// Producers decide per operation; `commit` drives the log.
    Standard,
    /// Every operation is logged synchronously.
    Always,
    /// `commit` is a no-op; durability comes from txg sync alone.
    Disabled,
}

/// Placement bias for log blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogBias {
    /// Prefer a dedicated log device.
    Latency,
    /// Keep log blocks on the main pool; large writes go indirect.
    Throughput,
}

/// Operation counters, the kstat analog. All relaxed; snapshot consistency
/// is not needed.
#[derive(Debug, Default)]
pub struct ZilStats {
    pub commit_count: AtomicU64,
    pub commit_writer_count: AtomicU64,
    pub itx_count: AtomicU64,
    pub itx_copied_count: AtomicU64,
    pub itx_copied_bytes: AtomicU64,
    pub itx_needcopy_count: AtomicU64,
    pub itx_needcopy_bytes: AtomicU64,
    pub itx_indirect_count: AtomicU64,
    pub itx_metadata_count: AtomicU64,
    pub lwb_alloc_count: AtomicU64,
    pub lwb_write_bytes: AtomicU64,
    pub flush_count: AtomicU64,
    pub flush_deferred: AtomicU64,
}

impl ZilStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// State serialized by the issuer lock: the drained commit list, record
/// sequencing, and the burst-sizing predictor.
pub(crate) struct Issuer {
    pub commit_list: std::collections::VecDeque<Itx>,
    /// Chain-wide record sequence; stamped at pack time.
    lr_seq: u64,
    /// Bytes of the burst currently being drained.
    cur_size: u64,
    /// Bytes of the current burst not yet packed into an lwb.
    cur_left: u64,
    /// Largest single record of the current burst.
    cur_max: u64,
    /// Writers detected racing with us; decays one per burst.
    parallel: u32,
    prev_min: [u64; ZIL_BURSTS],
    prev_opt: [u64; ZIL_BURSTS],
    prev_rotor: usize,
}

/// State guarded by the zilog lock (`zl_lock`): the lwb list and everything
/// the completion callbacks touch.
pub(crate) struct Inner {
    pub lwbs: std::collections::VecDeque<Arc<Lwb>>,
    pub last_lwb_opened: Option<Arc<Lwb>>,
    next_lwb_id: u64,
    /// EWMA of lwb issue-to-flush latency, nanoseconds.
    last_lwb_latency: u64,
    pub suspend: u32,
    pub suspending: bool,
    pub destroy_txg: u64,
    pub keep_first: bool,
    pub replaying: bool,
    /// Replay progress staged for publication by `sync`.
    pub replayed_seq: u64,
    pub parse: ParseCounts,
}

/// What the most recent chain walk observed; see `parse`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ParseCounts {
    pub max_blk_seq: u64,
    pub max_lr_seq: u64,
    pub blk_count: u64,
    pub lr_count: u64,
}

/// Per-dataset intent log.
pub struct Zilog<E: BlockEngine> {
    pub(crate) engine: Arc<E>,
    pub(crate) get_data: Box<dyn GetData>,
    pub(crate) opts: Options,
    pub(crate) io_rt: IoRuntime,
    pub(crate) stats: ZilStats,
    issuer: Mutex<Issuer>,
    pub(crate) inner: Mutex<Inner>,
    cv_suspend: Condvar,
    lwb_io: Mutex<[u64; TXG_SIZE]>,
    cv_io: Condvar,
    itxg: [Mutex<ItxgSlot>; TXG_SIZE],
    pub(crate) header: Mutex<ZilHeader>,
    cleaner: Cleaner,
    policy: Mutex<(SyncPolicy, LogBias)>,
    /// Mirror of `inner.suspend > 0`, readable under the itxg slot locks.
    suspended: AtomicU32,
}

impl<E: BlockEngine> Zilog<E> {
    pub fn open(engine: Arc<E>, get_data: impl GetData) -> Arc<Zilog<E>> {
        Self::with_options(engine, get_data, Options::default())
    }

    pub fn with_options(engine: Arc<E>, get_data: impl GetData, opts: Options) -> Arc<Zilog<E>> {
        let header = engine.load_header();
        Arc::new(Zilog {
            engine,
            get_data: Box::new(get_data),
            opts,
            io_rt: IoRuntime::new(),
            stats: ZilStats::default(),
            issuer: Mutex::new(Issuer {
                commit_list: Default::default(),
                lr_seq: 0,
                cur_size: 0,
                cur_left: 0,
                cur_max: 0,
                parallel: 0,
                prev_min: [0; ZIL_BURSTS],
                prev_opt: [0; ZIL_BURSTS],
                prev_rotor: 0,
            }),
            inner: Mutex::new(Inner {
                lwbs: Default::default(),
                last_lwb_opened: None,
                next_lwb_id: 0,
                last_lwb_latency: 0,
                suspend: 0,
                suspending: false,
                destroy_txg: 0,
                keep_first: false,
                replaying: false,
                replayed_seq: 0,
                parse: ParseCounts::default(),
            }),
            cv_suspend: Condvar::new(),
            lwb_io: Mutex::new([0; TXG_SIZE]),
            cv_io: Condvar::new(),
            itxg: Default::default(),
            header: Mutex::new(header),
            cleaner: Cleaner::new(),
            policy: Mutex::new((SyncPolicy::Standard, LogBias::Latency)),
            suspended: AtomicU32::new(0),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn stats(&self) -> &ZilStats {
        &self.stats
    }

    pub fn header(&self) -> ZilHeader {
        *self.header.lock()
    }

    pub fn parse_counts(&self) -> ParseCounts {
        self.inner.lock().parse
    }

    pub fn set_sync(&self, sync: SyncPolicy) {
        self.policy.lock().0 = sync;
    }

    pub fn set_logbias(&self, bias: LogBias) {
        self.policy.lock().1 = bias;
    }

    /// `true` while replay is applying records; producers must not log.
    pub fn replaying(&self) -> bool {
        self.inner.lock().replaying
    }

    /// Largest record payload a single log block can carry, after the
    /// trailer and `reserved` header bytes.
    pub fn max_log_data(&self, reserved: usize) -> usize {
        self.opts.max_block_size - TRAILER_LEN - reserved
    }

    /// Cap on the payload of a `WR_COPIED` record.
    pub fn max_copied_data(&self) -> usize {
        self.opts.max_copied_data.min(self.max_log_data(LrWrite::LEN))
    }

    /// Remaining capacity below this starts a new block rather than
    /// fragmenting records across it.
    fn max_waste_space(&self) -> usize {
        self.max_log_data(0) / 16
    }

    fn use_slog(&self) -> bool {
        self.policy.lock().1 == LogBias::Latency
    }

    /// Whether a block at `vdev` counts as log-device placement for priority
    /// and sizing decisions.
    fn is_slog_vdev(&self, vdev: u32) -> bool {
        self.engine.vdev_is_log(vdev)
            || (self.opts.special_is_slog && self.engine.vdev_is_special(vdev))
    }

    fn slot(&self, txg: u64) -> &Mutex<ItxgSlot> {
        &self.itxg[(txg % TXG_SIZE as u64) as usize]
    }

    /// Serialize against the writer pipeline without running it.
    pub(crate) fn issuer_guard(&self) -> parking_lot::MutexGuard<'_, Issuer> {
        self.issuer.lock()
    }

    fn otxg(&self) -> u64 {
        if self.engine.frozen() {
            ZILTEST_TXG
        } else {
            self.engine.last_synced_txg() + 1
        }
    }

    // ------------------------------------------------------------------
    // Itx assignment (data plane)
    // ------------------------------------------------------------------

    /// Queue `itx` for the transaction group `txg`.
    pub fn itx_assign(&self, mut itx: Itx, txg: u64) {
        // Data written to a renamed file must reach the chain before the
        // rename record itself.
        if itx.is_rename() {
            self.async_to_sync(itx.oid);
        } else if itx.txtype() == TxType::Remove && itx.oid != 0 {
            // The object id may be reused next txg; orphaned async itxs for
            // it must not survive.
            self.remove_async(itx.oid);
        }

        let txg = if self.engine.frozen() { ZILTEST_TXG } else { txg };
        itx.hdr.txg = txg;

        let mut slot = self.slot(txg).lock();
        if slot.txg != txg {
            // The ring wrapped: the old occupant belongs to a long-synced
            // txg. Snapshot it aside for cleanup.
            if let Some(old) = slot.itxs.take() {
                self.cleaner.dispatch(old);
            }
            slot.txg = txg;
            slot.itxs = Some(Box::default());
        }
        let list = slot.itxs.get_or_insert_with(Default::default);
        ZilStats::bump(&self.stats.itx_count);
        if itx.sync {
            list.sync.push_back(itx);
        } else {
            let oid = itx.oid;
            list.async_.entry(oid).or_default().push_back(itx);
        }
    }

    /// Promote async itxs for `foid` (all objects if zero) to the sync lists
    /// of the active txgs.
    fn async_to_sync(&self, foid: u64) {
        let otxg = self.otxg();
        for txg in otxg..otxg + TXG_CONCURRENT_STATES as u64 {
            let mut slot = self.slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            if let Some(list) = slot.itxs.as_mut() {
                list.promote(foid);
            }
        }
    }

    fn remove_async(&self, oid: u64) {
        let otxg = self.otxg();
        for txg in otxg..otxg + TXG_CONCURRENT_STATES as u64 {
            let mut slot = self.slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            if let Some(list) = slot.itxs.as_mut() {
                list.purge_async(oid);
            }
        }
    }

    /// Detach and free the itxs of a synced txg. Idempotent.
    pub fn clean(&self, synced_txg: u64) {
        let detached = self.slot(synced_txg).lock().detach_through(synced_txg);
        if let Some(list) = detached {
            self.cleaner.dispatch(list);
        }
    }

    // ------------------------------------------------------------------
    // Commit entry points
    // ------------------------------------------------------------------

    /// Make every sync itx logged so far for `foid` (all objects if zero)
    /// durable before returning.
    pub fn commit(self: &Arc<Self>, foid: u64) {
        if self.policy.lock().0 == SyncPolicy::Disabled {
            return;
        }
        if !self.engine.writable() {
            // Read-only import: there can be nothing volatile to commit.
            debug_assert!(self.inner.lock().lwbs.is_empty());
            return;
        }
        if self.suspended.load(Ordering::Acquire) > 0 {
            // Suspended: the log may not grow; durability via the main pool.
            self.engine.txg_wait_synced(0);
            return;
        }
        self.commit_impl(foid);
    }

    pub(crate) fn commit_impl(self: &Arc<Self>, foid: u64) {
        ZilStats::bump(&self.stats.commit_count);
        self.async_to_sync(foid);

        let waiter = CommitWaiter::new();
        self.commit_itx_assign(&waiter);

        let wait_txg = self.commit_writer(&waiter);
        if let Some(txg) = wait_txg {
            // Suspend race: our itxs were not spliced. Fall back to the main
            // pool; `clean` will complete the stranded waiter.
            self.engine.txg_wait_synced(txg);
        }
        self.commit_waiter(&waiter);

        if waiter.error().is_some() {
            // The lwb chain failed; the records reach disk with the next
            // txg sync instead.
            self.engine.txg_wait_synced(0);
        }
    }

    fn commit_itx_assign(&self, waiter: &Arc<CommitWaiter>) {
        let txg = self.engine.txg_hold();
        let mut itx = Itx::create(TxType::Commit, LrHeader::LEN);
        itx.waiter = Some(Arc::clone(waiter));
        self.itx_assign(itx, txg);
        self.engine.txg_rele(txg);
    }

    /// Run the writer pipeline. Returns a txg the caller must wait on if
    /// splicing was refused by a concurrent suspend.
    fn commit_writer(self: &Arc<Self>, waiter: &Arc<CommitWaiter>) -> Option<u64> {
        let mut iss = self.issuer.lock();
        if waiter.is_done() || waiter.lwb().is_some() {
            // Another writer already took care of us.
            return None;
        }
        ZilStats::bump(&self.stats.commit_writer_count);
        let wait_txg = self.get_commit_list(&mut iss);
        self.prune_commit_list(&mut iss);
        self.process_commit_list(&mut iss);
        self.burst_done(&mut iss);
        wait_txg
    }

    // ------------------------------------------------------------------
    // Draining the commit list
    // ------------------------------------------------------------------

    fn get_commit_list(&self, iss: &mut Issuer) -> Option<u64> {
        let mut wait_txg = None;
        let otxg = self.otxg();
        for txg in otxg..otxg + TXG_CONCURRENT_STATES as u64 {
            let mut slot = self.slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            if self.suspended.load(Ordering::Acquire) > 0 {
                // Do not extend the chain while suspending; the caller falls
                // back to txg_wait_synced for this txg.
                wait_txg = Some(wait_txg.map_or(txg, |w: u64| w.max(txg)));
                continue;
            }
            if let Some(list) = slot.itxs.as_mut() {
                for itx in &list.sync {
                    if !itx.is_commit() {
                        let sz = itx.full_size() as u64;
                        iss.cur_size += sz;
                        iss.cur_left += sz;
                        iss.cur_max = iss.cur_max.max(sz);
                    }
                }
                iss.commit_list.append(&mut list.sync);
            }
        }
        wait_txg
    }

    /// Drop leading commit itxs: nothing was logged before them, so their
    /// waiters either join the still-open tail lwb or are done already.
    fn prune_commit_list(&self, iss: &mut Issuer) {
        while let Some(itx) = iss.commit_list.front() {
            if !itx.is_commit() {
                break;
            }
            let mut itx = iss.commit_list.pop_front().unwrap();
            let waiter = itx.waiter.take().expect("commit itx carries a waiter");
            {
                let inner = self.inner.lock();
                match &inner.last_lwb_opened {
                    Some(lwb) if lwb.state() != LwbState::FlushDone => {
                        lwb.lock().waiters.push(Arc::clone(&waiter));
                        waiter.link_lwb(lwb);
                    }
                    _ => waiter.skip(),
                }
            }
            drop(itx);
        }
    }

    // ------------------------------------------------------------------
    // Packing itxs into lwbs
    // ------------------------------------------------------------------

    fn process_commit_list(self: &Arc<Self>, iss: &mut Issuer) {
        if iss.commit_list.is_empty() {
            return;
        }

        let mut lwb = {
            let inner = self.inner.lock();
            match inner.lwbs.back() {
                Some(tail) => {
                    // A tail still OPENED, or a predecessor still in flight,
                    // means another writer raced us: reserve predictor space
                    // for overlapping bursts.
                    let racing = tail.state() == LwbState::Opened
                        || inner
                            .lwbs
                            .len()
                            .checked_sub(2)
                            .map(|i| inner.lwbs[i].state() != LwbState::FlushDone)
                            .unwrap_or(false);
                    if racing {
                        iss.parallel = ZIL_BURSTS as u32;
                    }
                    Some(Arc::clone(tail))
                }
                None => None,
            }
        };
        if lwb.is_none() {
            lwb = Some(self.create(iss));
        }

        let mut ilwbs: Vec<Arc<Lwb>> = Vec::new();
        let mut nolwb_waiters = Vec::new();
        let mut nolwb_itxs = Vec::new();
        let last_synced = self.engine.last_synced_txg();

        while let Some(itx) = iss.commit_list.pop_front() {
            let txg = itx.hdr.txg;
            // Records of a fully synced txg are already durable in the main
            // pool; commit itxs still must attach a waiter to some lwb.
            if !itx.is_commit() && txg != ZILTEST_TXG && txg <= last_synced {
                drop(itx);
                continue;
            }
            match lwb.take() {
                Some(cur) => {
                    let (next, returned) = self.lwb_assign(cur, itx, iss, &mut ilwbs);
                    lwb = next;
                    if let Some(itx) = returned {
                        if let Some(w) = itx.waiter.clone() {
                            nolwb_waiters.push(w);
                        }
                        nolwb_itxs.push(itx);
                    }
                }
                None => {
                    if let Some(w) = itx.waiter.clone() {
                        nolwb_waiters.push(w);
                    }
                    nolwb_itxs.push(itx);
                }
            }
        }

        if lwb.is_none() {
            // Allocation failed mid-chain: push out what was closed (the
            // failed lwb completes its waiters through its errored root
            // I/O), then stall until the txg carries the data home.
            debug!("writer stalling after allocation failure");
            for l in ilwbs.drain(..) {
                self.lwb_write_issue(iss, &l);
            }
            self.writer_stall();
            for w in nolwb_waiters {
                w.skip();
            }
            drop(nolwb_itxs);
        } else {
            debug_assert!(nolwb_itxs.is_empty());
            for l in ilwbs.drain(..) {
                self.lwb_write_issue(iss, &l);
            }
            // The tail lwb stays OPENED so near-future commits can batch
            // onto it; the commit waiter's timeout closes it otherwise.
        }
    }

    /// Place one itx into the open lwb, closing and chaining new lwbs as
    /// needed. Returns the (possibly new) open lwb, or `None` plus the
    /// unplaced itx when the chain has stalled.
    fn lwb_assign(
        self: &Arc<Self>,
        mut lwb: Arc<Lwb>,
        mut itx: Itx,
        iss: &mut Issuer,
        ilwbs: &mut Vec<Arc<Lwb>>,
    ) -> (Option<Arc<Lwb>>, Option<Itx>) {
        self.lwb_write_open(&lwb);

        if itx.is_commit() {
            let waiter = itx.waiter.clone().expect("commit itx carries a waiter");
            let _inner = self.inner.lock();
            let mut li = lwb.lock();
            debug_assert!(li.state == LwbState::Opened);
            li.waiters.push(Arc::clone(&waiter));
            li.itxs.push(itx);
            drop(li);
            waiter.link_lwb(&lwb);
            return (Some(lwb), None);
        }

        // WR_COPIED payloads are fetched now, into the record itself; a
        // producer failure downgrades to WR_NEED_COPY (issue-time fetch).
        if itx.wr_state == Some(WriteState::Copied) {
            self.commit_copied(&mut itx);
        }
        self.note_write_stats(&itx);

        let reclen = itx.hdr.reclen as usize;
        let mut remaining = match itx.wr_state {
            Some(WriteState::NeedCopy) => itx.lr_write().length as usize,
            _ => 0,
        };

        loop {
            let sp = {
                let li = lwb.lock();
                li.nmax() - li.nused
            };
            let dlen = p2roundup(remaining);
            let can_split = itx.wr_state == Some(WriteState::NeedCopy) && remaining > 0;

            if reclen + dlen <= sp {
                self.attach(iss, &lwb, itx);
                return (Some(lwb), None);
            }

            let split_here =
                can_split && sp >= self.max_waste_space() && sp >= reclen + 8;
            if !split_here {
                match self.lwb_write_close(&lwb, iss, ilwbs, reclen + 8, LwbState::Opened) {
                    Some(next) => {
                        lwb = next;
                        continue;
                    }
                    None => return (None, Some(itx)),
                }
            }

            // Split: carve a fragment that fills the remaining space; the
            // residue repeats against the next block.
            let dnow = ((sp - reclen) & !7).min(remaining);
            let lrw = itx.lr_write();
            let mut frag = Itx::create(TxType::Write, LrWrite::LEN);
            frag.hdr.txg = itx.hdr.txg;
            frag.set_wr_state(WriteState::NeedCopy);
            frag.oid = itx.oid;
            frag.gen = itx.gen;
            frag.private = itx.private.clone();
            frag.set_lr_write(&LrWrite {
                foid: lrw.foid,
                offset: lrw.offset,
                length: dnow as u64,
                blkptr: None,
            });
            self.attach(iss, &lwb, frag);

            itx.set_lr_write(&LrWrite {
                foid: lrw.foid,
                offset: lrw.offset + dnow as u64,
                length: (lrw.length as usize - dnow) as u64,
                blkptr: lrw.blkptr,
            });
            remaining -= dnow;
        }
    }

    fn attach(&self, iss: &mut Issuer, lwb: &Arc<Lwb>, mut itx: Itx) {
        iss.lr_seq += 1;
        itx.hdr.seq = iss.lr_seq;
        iss.cur_left = iss.cur_left.saturating_sub(itx.full_size() as u64);
        let mut li = lwb.lock();
        li.nused += itx.full_size();
        li.max_txg = li.max_txg.max(itx.hdr.txg);
        li.itxs.push(itx);
        li.check_size_invariants();
    }

    fn commit_copied(&self, itx: &mut Itx) {
        let mut lrw = itx.lr_write();
        let len = lrw.length as usize;
        let (gen, private) = (itx.gen, itx.private.clone());
        let data_at = LrWrite::BODY_LEN;
        let res = self.get_data.get_data(
            private.as_deref(),
            gen,
            &mut lrw,
            Some(&mut itx.body[data_at..data_at + len]),
            None,
        );
        if res.is_err() {
            // Fetch again at issue time instead.
            itx.set_wr_state(WriteState::NeedCopy);
            itx.hdr.reclen = LrWrite::LEN as u64;
            itx.body.truncate(LrWrite::BODY_LEN);
        }
    }

    fn note_write_stats(&self, itx: &Itx) {
        match itx.wr_state {
            Some(WriteState::Copied) => {
                ZilStats::bump(&self.stats.itx_copied_count);
                ZilStats::add(&self.stats.itx_copied_bytes, itx.lr_write().length);
            }
            Some(WriteState::NeedCopy) => {
                ZilStats::bump(&self.stats.itx_needcopy_count);
                ZilStats::add(&self.stats.itx_needcopy_bytes, itx.lr_write().length);
            }
            Some(WriteState::Indirect) => ZilStats::bump(&self.stats.itx_indirect_count),
            None => ZilStats::bump(&self.stats.itx_metadata_count),
        }
    }

    // ------------------------------------------------------------------
    // Sizing predictor
    // ------------------------------------------------------------------

    /// How a burst of `size` record bytes would be cut into blocks: returns
    /// the even chunk size and the smallest first block that still serves
    /// the burst in one pass.
    fn lwb_plan(&self, iss: &Issuer, size: usize) -> (usize, usize) {
        let md = self.max_log_data(0);
        let waste = self.max_waste_space().max(iss.cur_max as usize);
        if size <= md {
            return (size, size);
        }
        if size > 8 * md {
            // Huge bursts use full blocks; only the residue is negotiable.
            return (md, (size % md).max(waste));
        }
        let per = md - LrWrite::LEN;
        let n = size.div_ceil(per);
        let chunk = size.div_ceil(n);
        let minsize = (size - (n - 1) * chunk).max(waste);
        (chunk, minsize)
    }

    /// Predicted record capacity for the next first block: the smaller of
    /// the two largest observed burst minima if that halves the space, else
    /// the larger. One possible extra write is traded for the savings.
    fn lwb_predict(&self, iss: &Issuer) -> usize {
        let (mut m1, mut m2) = (0u64, 0u64);
        for &v in &iss.prev_min {
            if v > m1 {
                m2 = m1;
                m1 = v;
            } else if v > m2 {
                m2 = v;
            }
        }
        let mut pick = if m2 > 0 && m2 * 2 <= m1 { m2 } else { m1 };
        if iss.parallel > 0 {
            // Reserve for the anticipated second writer's burst.
            pick = pick.max(iss.prev_opt.iter().copied().max().unwrap_or(0));
        }
        pick as usize
    }

    /// Block size for the next lwb: predictor output, raised for whatever
    /// is left of the burst being drained, and never smaller than the
    /// record that forced the previous block closed.
    fn next_block_size(&self, iss: &Issuer, needed: usize) -> usize {
        let mut want = self.lwb_predict(iss);
        if iss.cur_left > 0 {
            want = want.max(self.lwb_plan(iss, iss.cur_left as usize).0);
        }
        let want = want.max(needed) + TRAILER_LEN;
        want.next_multiple_of(ZIL_MIN_BLKSZ)
            .clamp(ZIL_MIN_BLKSZ, self.opts.max_block_size)
    }

    /// Bookkeeping at the end of a drained burst: rotate the predictor
    /// history and decay the parallel-writer hint.
    fn burst_done(&self, iss: &mut Issuer) {
        if !iss.commit_list.is_empty() || iss.cur_size == 0 {
            return;
        }
        if iss.parallel > 0 {
            iss.parallel -= 1;
        }
        let (opt, min) = self.lwb_plan(iss, iss.cur_size as usize);
        let r = (iss.prev_rotor + 1) % ZIL_BURSTS;
        iss.prev_rotor = r;
        iss.prev_min[r] = min as u64;
        iss.prev_opt[r] = opt as u64;
        iss.cur_size = 0;
        iss.cur_left = 0;
        iss.cur_max = 0;
    }

    // ------------------------------------------------------------------
    // Lwb lifecycle
    // ------------------------------------------------------------------

    fn alloc_lwb(
        &self,
        size: usize,
        blk: Option<BlockPointer>,
        state: LwbState,
        alloc_txg: u64,
        slog: bool,
    ) -> Arc<Lwb> {
        let mut inner = self.inner.lock();
        let id = inner.next_lwb_id;
        inner.next_lwb_id += 1;
        let slim = blk.map_or(self.opts.slim, |b| b.slim);
        let lwb = Lwb::new(id, size, slim, blk, state, alloc_txg);
        lwb.lock().slog = slog;
        inner.lwbs.push_back(Arc::clone(&lwb));
        if state == LwbState::Opened {
            inner.last_lwb_opened = Some(Arc::clone(&lwb));
        }
        ZilStats::bump(&self.stats.lwb_alloc_count);
        lwb
    }

    /// Start a fresh chain: allocate the first block under a new chain
    /// checksum and wait for the header to point at it durably, since a
    /// crash must never leave a reachable-from-nowhere chain. An allocation
    /// failure is recorded on the lwb; the close path turns it into a
    /// stall.
    fn create(&self, iss: &mut Issuer) -> Arc<Lwb> {
        let destroy_txg = self.inner.lock().destroy_txg;
        if destroy_txg != 0 {
            // A destroy is still pending sync; the header must settle first.
            self.engine.txg_wait_synced(destroy_txg);
        }

        let txg = self.engine.txg_hold();

        // A first block kept by a previous destroy is released; the new
        // chain starts under a fresh GUID.
        let old = self.header.lock().log.take();
        if let Some(bp) = old {
            self.engine.free_block(txg, &bp);
        }

        let size = self.next_block_size(iss, 0);
        let lwb = match self
            .engine
            .alloc_log_block(txg, size as u64, None, self.use_slog())
        {
            Ok(mut blk) => {
                // The initial seed is seq 1; the first block carries the
                // advanced seed, like every link after it.
                blk.cksum = ChainChecksum::new_chain(self.engine.objset()).advance();
                blk.slim = self.opts.slim;
                debug!("created log chain at {blk:?}");
                let slog = self.is_slog_vdev(blk.vdev);
                self.alloc_lwb(size, Some(blk), LwbState::Opened, txg, slog)
            }
            Err(e) => {
                warn!("log chain creation failed: {e}");
                let lwb = self.alloc_lwb(size, None, LwbState::Opened, txg, false);
                lwb.lock().error = Some(e);
                lwb
            }
        };
        self.engine.txg_rele(txg);
        if lwb.lock().blk.is_some() {
            // `sync` publishes the head block into the header during this
            // wait.
            self.engine.txg_wait_synced(txg);
        }
        lwb
    }

    fn lwb_write_open(&self, lwb: &Arc<Lwb>) {
        let mut inner = self.inner.lock();
        let mut li = lwb.lock();
        if li.state == LwbState::New {
            li.state = LwbState::Opened;
            li.opened_at = Some(Instant::now());
            drop(li);
            inner.last_lwb_opened = Some(Arc::clone(lwb));
        }
    }

    /// Close the lwb for packing and queue it for issue. Returns the fresh
    /// successor, or `None` when the lwb's own block allocation had failed
    /// and the caller must stall.
    fn lwb_write_close(
        &self,
        lwb: &Arc<Lwb>,
        iss: &Issuer,
        ilwbs: &mut Vec<Arc<Lwb>>,
        needed: usize,
        succ_state: LwbState,
    ) -> Option<Arc<Lwb>> {
        {
            let mut li = lwb.lock();
            debug_assert_eq!(li.state, LwbState::Opened);
            li.state = LwbState::Closed;
        }
        ilwbs.push(Arc::clone(lwb));

        if let Some(e) = lwb.lock().error {
            trace!("lwb {} closed carrying allocation error {e}", lwb.id);
            return None;
        }
        let size = self.next_block_size(iss, needed);
        Some(self.alloc_lwb(size, None, succ_state, 0, false))
    }

    /// Fill the buffer of a CLOSED lwb and issue it if its block pointer is
    /// known; otherwise it parks in READY until a predecessor's issue hands
    /// the pointer over.
    fn lwb_write_issue(self: &Arc<Self>, iss: &mut Issuer, lwb: &Arc<Lwb>) {
        debug_assert_eq!(lwb.state(), LwbState::Closed);
        self.lwb_commit_itxs(lwb);

        let root = {
            let zilog = Arc::clone(self);
            let lw = Arc::clone(lwb);
            self.io_rt
                .root(Box::new(move |err| zilog.lwb_flush_vdevs_done(&lw, err)))
        };
        {
            let mut li = lwb.lock();
            li.root_io = Some(root);
            li.state = LwbState::Ready;
        }

        let mut cur = Arc::clone(lwb);
        loop {
            let (blk, err, root) = {
                let li = cur.lock();
                debug_assert_eq!(li.state, LwbState::Ready);
                (li.blk, li.error, li.root_io.clone().unwrap())
            };
            let next = if let Some(blk) = blk {
                self.lwb_issue_with_blk(iss, &cur, blk, root)
            } else if let Some(err) = err {
                // No block was ever allocated: complete the root with the
                // error so attached waiters observe it.
                self.lwb_mark_issued(&cur, self.engine.txg_hold_and_rele());
                root.fail(err);
                root.nowait();
                None
            } else {
                // A hole: the predecessor's issue will finish the job.
                None
            };
            match next {
                Some(next) => cur = next,
                None => return,
            }
        }
    }

    fn lwb_mark_issued(&self, lwb: &Arc<Lwb>, txg: u64) {
        {
            let mut li = lwb.lock();
            li.state = LwbState::Issued;
            li.issued_at = Some(Instant::now());
            li.issued_txg = txg;
        }
        let mut io = self.lwb_io.lock();
        io[(txg % TXG_SIZE as u64) as usize] += 1;
    }

    /// Issue the write for `lwb` at `blk`: allocate the successor's block,
    /// seal the trailer around it, wire the ordering edges, and hand the
    /// write to the engine. Returns the successor if it was already READY
    /// and is now this thread's to issue.
    fn lwb_issue_with_blk(
        self: &Arc<Self>,
        iss: &mut Issuer,
        lwb: &Arc<Lwb>,
        blk: BlockPointer,
        root: Io,
    ) -> Option<Arc<Lwb>> {
        let (prev, nlwb) = {
            let inner = self.inner.lock();
            let pos = inner
                .lwbs
                .iter()
                .position(|l| Arc::ptr_eq(l, lwb))
                .expect("issuing an lwb not on the chain");
            (
                pos.checked_sub(1).map(|p| Arc::clone(&inner.lwbs[p])),
                inner.lwbs.get(pos + 1).cloned(),
            )
        };

        let txg = self.engine.txg_hold();
        defer! { self.engine.txg_rele(txg) }

        // The successor's address must be known now: this block's trailer
        // is the only place that names it.
        let mut next_bp = None;
        let mut next_err = None;
        if let Some(n) = &nlwb {
            let nsize = n.lock().sz();
            match self
                .engine
                .alloc_log_block(txg, nsize as u64, Some(&blk), self.use_slog())
            {
                Ok(mut nb) => {
                    nb.cksum = blk.cksum.advance();
                    nb.slim = self.opts.slim;
                    next_bp = Some(nb);
                }
                Err(e) => {
                    warn!("log block allocation failed for lwb {}: {e}", n.id);
                    next_err = Some(e);
                }
            }
        }

        let (data, slog) = {
            let mut li = lwb.lock();
            let nused = li.nused;
            let slim = li.slim;
            let slog = li.slog;
            seal_block(&mut li.buf, slim, nused, next_bp.as_ref(), blk.cksum);
            // The slim layout lets the write shrink to the used prefix.
            let wlen = if slim {
                (TRAILER_LEN + nused)
                    .next_multiple_of(ZIL_MIN_BLKSZ)
                    .min(li.sz())
            } else {
                li.sz()
            };
            (li.buf[..wlen].to_vec(), slog)
        };

        let prio = if slog && iss.cur_size <= self.opts.slog_bulk {
            IoPriority::SyncWrite
        } else {
            IoPriority::AsyncWrite
        };
        ZilStats::add(&self.stats.lwb_write_bytes, data.len() as u64);
        let write = {
            let engine = Arc::clone(&self.engine);
            let zilog = Arc::clone(self);
            let lw = Arc::clone(lwb);
            let exec: crate::engine::io::ExecFn =
                Box::new(move || engine.write_block(&blk, &data, prio));
            self.io_rt.op(
                exec,
                Some(Box::new(move |err| zilog.lwb_write_done(&lw, err))),
            )
        };
        root.add_child(&write);
        {
            let mut li = lwb.lock();
            li.write_io = Some(write.clone());
        }
        lwb.add_vdev(blk.vdev);

        // Ordering discipline: our root completes only after the previous
        // lwb's; and if the previous lwb deferred its flushes to us, our
        // write must not finish before its data is on disk.
        if let Some(prev) = prev {
            let pli = prev.lock();
            if pli.state >= LwbState::Issued && pli.state < LwbState::FlushDone {
                if let Some(proot) = pli.root_io.clone() {
                    root.add_child(&proot);
                }
                if pli.waiters.is_empty() {
                    if let Some(pwrite) = pli.write_io.clone() {
                        write.add_child(&pwrite);
                    }
                }
            }
        }

        if let Some(child) = lwb.lock().child_io.clone() {
            write.add_child(&child);
            child.nowait();
        }

        self.lwb_mark_issued(lwb, txg);
        trace!(
            "issue lwb {} at vdev {} offset {} seq {}",
            lwb.id,
            blk.vdev,
            blk.offset,
            blk.cksum.seq
        );

        // Hand the successor its block (or the bad news).
        let mut issue_next = None;
        if let Some(n) = &nlwb {
            let mut ni = n.lock();
            ni.blk = next_bp;
            ni.error = next_err;
            if let Some(nb) = next_bp {
                ni.slog = self.is_slog_vdev(nb.vdev);
                ni.alloc_txg = txg;
            }
            if ni.state == LwbState::Ready {
                issue_next = Some(Arc::clone(n));
            }
        }

        root.nowait();
        write.nowait();
        issue_next
    }

    /// Copy each attached itx's record into the buffer (CLOSED window),
    /// fetching deferred payloads through the producer.
    fn lwb_commit_itxs(self: &Arc<Self>, lwb: &Arc<Lwb>) {
        let child = {
            let mut li = lwb.lock();
            debug_assert_eq!(li.state, LwbState::Closed);
            let child = self.io_rt.op(Box::new(|| Ok(())), None);
            li.child_io = Some(child.clone());
            child
        };

        let count = lwb.lock().itxs.len();
        for i in 0..count {
            // Lay the record down from the itx under the lwb lock; producer
            // calls happen with no locks held.
            enum Fetch {
                None,
                NeedCopy { at: usize, len: usize },
                Indirect { at: usize },
            }
            let (fetch, gen, private, mut lrw) = {
                let mut li = lwb.lock();
                let start = li.records_start();
                let at = start + li.nfilled;
                let itx = &li.itxs[i];
                if itx.is_commit() {
                    continue;
                }
                let mut hdr = itx.hdr;
                let wr_state = itx.wr_state;
                let gen = itx.gen;
                let private = itx.private.clone();
                let lrw = wr_state.map(|_| itx.lr_write()).unwrap_or_default();
                let body = itx.body.clone();
                match wr_state {
                    Some(WriteState::NeedCopy) => {
                        let dlen = p2roundup(lrw.length as usize);
                        hdr.reclen = (LrWrite::LEN + dlen) as u64;
                        hdr.encode_into(&mut li.buf[at..]);
                        let body_at = at + LrHeader::LEN;
                        li.buf[body_at..body_at + body.len()].copy_from_slice(&body);
                        li.nfilled += hdr.reclen as usize;
                        (
                            Fetch::NeedCopy {
                                at: at + LrWrite::LEN,
                                len: lrw.length as usize,
                            },
                            gen,
                            private,
                            lrw,
                        )
                    }
                    Some(WriteState::Indirect) => {
                        hdr.encode_into(&mut li.buf[at..]);
                        let body_at = at + LrHeader::LEN;
                        li.buf[body_at..body_at + body.len()].copy_from_slice(&body);
                        li.nfilled += hdr.reclen as usize;
                        (Fetch::Indirect { at: body_at }, gen, private, lrw)
                    }
                    _ => {
                        hdr.encode_into(&mut li.buf[at..]);
                        let body_at = at + LrHeader::LEN;
                        li.buf[body_at..body_at + body.len()].copy_from_slice(&body);
                        li.nfilled += hdr.reclen as usize;
                        (Fetch::None, gen, private, lrw)
                    }
                }
            };

            match fetch {
                Fetch::None => {}
                Fetch::NeedCopy { at, len } => {
                    let mut tmp = vec![0u8; len];
                    let res = self.get_data.get_data(
                        private.as_deref(),
                        gen,
                        &mut lrw,
                        Some(&mut tmp),
                        None,
                    );
                    match res {
                        Ok(()) => {
                            let mut li = lwb.lock();
                            li.buf[at..at + len].copy_from_slice(&tmp);
                        }
                        Err(EngineError::Io) => {
                            // The data cannot be read back; make the txg
                            // durable instead so replay skips this record.
                            self.engine.txg_wait_synced(self.txg_of(lwb, i));
                        }
                        Err(e) => {
                            debug_assert!(matches!(
                                e,
                                EngineError::NotFound
                                    | EngineError::Exists
                                    | EngineError::Already
                            ));
                        }
                    }
                }
                Fetch::Indirect { at } => {
                    let res = self.get_data.get_data(
                        private.as_deref(),
                        gen,
                        &mut lrw,
                        None,
                        Some(&child),
                    );
                    match res {
                        Ok(()) => {
                            let mut li = lwb.lock();
                            lrw.write_into(&mut li.buf[at..]);
                        }
                        Err(EngineError::Io) => {
                            self.engine.txg_wait_synced(self.txg_of(lwb, i));
                        }
                        Err(e) => {
                            debug_assert!(matches!(
                                e,
                                EngineError::NotFound
                                    | EngineError::Exists
                                    | EngineError::Already
                            ));
                        }
                    }
                }
            }
        }

        let li = lwb.lock();
        debug_assert_eq!(li.nfilled, li.nused);
    }

    fn txg_of(&self, lwb: &Arc<Lwb>, i: usize) -> u64 {
        lwb.lock().itxs[i].hdr.txg
    }

    // ------------------------------------------------------------------
    // Completion callbacks
    // ------------------------------------------------------------------

    /// Write-completion: either defer this lwb's cache flushes to the next
    /// lwb, or issue them as children of the root I/O.
    fn lwb_write_done(self: &Arc<Self>, lwb: &Arc<Lwb>, err: Option<EngineError>) {
        {
            let mut li = lwb.lock();
            debug_assert_eq!(li.state, LwbState::Issued);
            li.state = LwbState::WriteDone;
            // The block image is on its way; the buffer is dead weight.
            li.buf = Vec::new();
        }
        if err.is_some() {
            // Abandon: the error rides up the root chain to the waiters.
            let _ = lwb.take_vdevs();
            return;
        }
        if self.opts.nocacheflush {
            let _ = lwb.take_vdevs();
            return;
        }

        let (nlwb, no_waiters) = {
            let inner = self.inner.lock();
            let pos = inner.lwbs.iter().position(|l| Arc::ptr_eq(l, lwb));
            let nlwb = pos.and_then(|p| inner.lwbs.get(p + 1)).cloned();
            (nlwb, lwb.lock().waiters.is_empty())
        };
        let vdevs = lwb.take_vdevs();
        if no_waiters {
            if let Some(next) = nlwb {
                // Nobody is waiting on this lwb: coalesce its flushes into
                // the successor's set.
                ZilStats::bump(&self.stats.flush_deferred);
                next.merge_vdevs(vdevs);
                return;
            }
        }
        let root = lwb.lock().root_io.clone().expect("written lwb has a root");
        for vdev in vdevs {
            ZilStats::bump(&self.stats.flush_count);
            let engine = Arc::clone(&self.engine);
            let flush = self
                .io_rt
                .op(Box::new(move || engine.flush_vdev(vdev)), None);
            root.add_child(&flush);
            flush.nowait();
        }
    }

    /// Root-completion: the lwb and all its flushes (and predecessors) are
    /// done. Destroy the itxs, wake the waiters, release the inflight slot.
    fn lwb_flush_vdevs_done(self: &Arc<Self>, lwb: &Arc<Lwb>, err: Option<EngineError>) {
        let (itxs, waiters, issued_txg, error) = {
            let mut inner = self.inner.lock();
            let mut li = lwb.lock();
            debug_assert!(matches!(li.state, LwbState::WriteDone | LwbState::Issued));
            li.state = LwbState::FlushDone;
            if li.error.is_none() {
                li.error = err;
            }
            if let Some(at) = li.issued_at {
                let sample = at.elapsed().as_nanos() as u64;
                inner.last_lwb_latency = (inner.last_lwb_latency * 7 + sample) / 8;
            }
            (
                std::mem::take(&mut li.itxs),
                std::mem::take(&mut li.waiters),
                li.issued_txg,
                li.error,
            )
        };

        // Waiters first, so the itx destructors below observe them done.
        for w in waiters {
            w.done(error);
        }
        drop(itxs);

        let mut io = self.lwb_io.lock();
        let slot = (issued_txg % TXG_SIZE as u64) as usize;
        io[slot] -= 1;
        if io[slot] == 0 {
            self.cv_io.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Commit waiter
    // ------------------------------------------------------------------

    fn commit_waiter(self: &Arc<Self>, waiter: &Arc<CommitWaiter>) {
        loop {
            if waiter.is_done() {
                return;
            }
            let lwb = waiter.lwb();
            let open = matches!(lwb.as_ref().map(|l| l.state()), Some(LwbState::Opened));
            if !open {
                waiter.wait();
                return;
            }
            // The lwb is still open: bound the wait by a percentage of the
            // observed lwb latency, then close and issue it ourselves.
            let latency = self.inner.lock().last_lwb_latency;
            let budget =
                Duration::from_nanos(latency * self.opts.commit_timeout_pct as u64 / 100);
            if !budget.is_zero() && waiter.wait_timed(budget) {
                return;
            }
            self.commit_waiter_timeout(waiter);
        }
    }

    /// The waiter timed out with its lwb still open: take over the issuer's
    /// job for this one lwb. The waiter lock is never held here.
    fn commit_waiter_timeout(self: &Arc<Self>, waiter: &Arc<CommitWaiter>) {
        let mut iss = self.issuer.lock();
        if waiter.is_done() {
            return;
        }
        let Some(lwb) = waiter.lwb() else { return };
        if lwb.state() != LwbState::Opened {
            // Issued in the meantime; go back to waiting.
            return;
        }
        trace!("commit waiter timeout: closing lwb {}", lwb.id);
        let mut ilwbs = Vec::new();
        let stalled = self
            .lwb_write_close(&lwb, &iss, &mut ilwbs, 0, LwbState::New)
            .is_none();
        for l in ilwbs {
            self.lwb_write_issue(&mut iss, &l);
        }
        if stalled {
            self.writer_stall();
        }
    }

    /// Allocation failed and the chain cannot grow: wait for the open txgs
    /// to carry the data into the main pool. `sync` frees the dead chain;
    /// the next commit starts a fresh one.
    fn writer_stall(&self) {
        self.engine.txg_wait_synced(0);
        debug_assert!(self.inner.lock().lwbs.is_empty());
    }

    // ------------------------------------------------------------------
    // Txg-driven reclamation
    // ------------------------------------------------------------------

    /// One pass per syncing txg: drain this txg's inflight lwbs, settle a
    /// pending destroy, then publish and free completed head lwbs.
    pub fn sync(&self, txg: u64) {
        self.lwb_flush_wait_all(txg);

        let mut hdr = self.header.lock();
        let mut inner = self.inner.lock();

        if inner.replayed_seq != 0 {
            hdr.replay_seq = inner.replayed_seq;
            inner.replayed_seq = 0;
        }

        if inner.destroy_txg == txg {
            let kept = hdr.log;
            debug_assert!(inner.lwbs.is_empty());
            *hdr = ZilHeader::default();
            if inner.keep_first {
                hdr.log = kept;
            }
            inner.destroy_txg = 0;
            debug!("destroyed log header in txg {txg} (keep_first={})", inner.keep_first);
        }

        while let Some(lwb) = inner.lwbs.front().cloned() {
            let li = lwb.lock();
            hdr.log = li.blk;
            if li.state != LwbState::FlushDone || li.alloc_txg > txg || li.max_txg > txg {
                break;
            }
            let blk = li.blk;
            drop(li);
            inner.lwbs.pop_front();
            if let Some(bp) = blk {
                self.engine.free_block(txg, &bp);
            }
            if inner.lwbs.is_empty() {
                hdr.log = None;
            }
        }

        self.engine.store_header(&hdr, txg);
    }

    /// Invariant: after `sync(txg)`, no lwb issued in `txg` is inflight.
    fn lwb_flush_wait_all(&self, txg: u64) {
        let slot = (txg % TXG_SIZE as u64) as usize;
        let mut io = self.lwb_io.lock();
        while io[slot] > 0 {
            self.cv_io.wait(&mut io);
        }
    }

    // ------------------------------------------------------------------
    // Suspend / resume / close
    // ------------------------------------------------------------------

    /// Quiesce the log: drain everything in flight, destroy the chain, and
    /// block new chain growth until `resume`.
    pub fn suspend(self: &Arc<Self>) -> Result<(), SuspendError> {
        let hdr = self.header();
        if hdr.flags.contains(crate::chain::HeaderFlags::REPLAY_NEEDED) {
            return Err(SuspendError::ReplayNeeded);
        }

        let mut inner = self.inner.lock();
        if hdr.log.is_none() || inner.suspend > 0 {
            inner.suspend += 1;
            self.suspended.fetch_add(1, Ordering::Release);
            // Someone else is mid-drain: wait until the chain is gone.
            while inner.suspending {
                self.cv_suspend.wait(&mut inner);
            }
            return Ok(());
        }
        if self.engine.encrypted() && !self.engine.key_available() {
            return Err(SuspendError::KeyUnavailable);
        }
        inner.suspend += 1;
        self.suspended.fetch_add(1, Ordering::Release);
        inner.suspending = true;
        drop(inner);

        debug!("suspending intent log");
        self.commit_impl(0);
        self.engine.txg_wait_synced(0);
        self.destroy(false);
        self.engine.txg_wait_synced(0);

        let mut inner = self.inner.lock();
        inner.suspending = false;
        self.cv_suspend.notify_all();
        Ok(())
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.suspend > 0, "resume without suspend");
        inner.suspend -= 1;
        self.suspended.fetch_sub(1, Ordering::Release);
    }

    /// Tear down the in-memory state; the caller guarantees no concurrent
    /// producers. Pending work is pushed through the main pool.
    pub fn close(self: &Arc<Self>) {
        let max_txg = {
            let inner = self.inner.lock();
            inner
                .lwbs
                .iter()
                .map(|l| {
                    let li = l.lock();
                    li.max_txg.max(li.alloc_txg)
                })
                .max()
                .unwrap_or(0)
        };
        if max_txg > 0 && max_txg != ZILTEST_TXG {
            self.engine.txg_wait_synced(max_txg);
        } else {
            self.engine.txg_wait_synced(0);
        }

        let mut inner = self.inner.lock();
        // Only a never-issued tail may remain; dropping it skips its
        // waiters.
        if let Some(lwb) = inner.lwbs.pop_front() {
            debug_assert!(inner.lwbs.is_empty());
            debug_assert!(lwb.state() <= LwbState::Opened);
        }
        inner.last_lwb_opened = None;
    }
}

/// `txg_hold` immediately followed by `txg_rele`: a point-in-time read of
/// the open txg for accounting on paths that allocate nothing.
trait TxgHoldExt {
    fn txg_hold_and_rele(&self) -> u64;
}

impl<E: BlockEngine> TxgHoldExt for Arc<E> {
    fn txg_hold_and_rele(&self) -> u64 {
        let txg = self.txg_hold();
        self.txg_rele(txg);
        txg
    }
}
