//! Log write blocks: one allocated, chain-linked on-disk block and its
//! in-memory lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::chain::{BlockPointer, TRAILER_LEN};
use crate::engine::io::Io;
use crate::error::EngineError;
use crate::record::Itx;
use crate::waiter::CommitWaiter;

/// Lifecycle of an lwb.
///
/// ```text
/// NEW -> OPENED -> CLOSED -> READY -> ISSUED -> WRITE_DONE -> FLUSH_DONE
/// ```
///
/// `READY` is the window in which the buffer is sealed but the block pointer
/// may not be known yet (a predecessor's issue allocates it).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LwbState {
    New,
    Opened,
    Closed,
    Ready,
    Issued,
    WriteDone,
    FlushDone,
}

pub struct Lwb {
    /// Create-order stamp; list order, issue order, and on-disk order all
    /// follow it.
    pub id: u64,
    inner: Mutex<LwbInner>,
    /// Vdevs written on behalf of this lwb, whose caches must be flushed
    /// before its waiters may be signalled. Guarded separately: completion
    /// callbacks touch it without the main lwb lock.
    vdevs: Mutex<BTreeSet<u32>>,
}

pub struct LwbInner {
    pub state: LwbState,
    /// Trailer-first layout if `true`, trailer-last otherwise.
    pub slim: bool,
    /// The block was allocated on a dedicated log device.
    pub slog: bool,
    /// Where this lwb will be (or was) written. `None` until the
    /// predecessor's issue hands the allocation over.
    pub blk: Option<BlockPointer>,
    /// Allocation or I/O error attributed to this lwb.
    pub error: Option<EngineError>,
    /// Block image under construction; emptied once written.
    pub buf: Vec<u8>,
    /// Record bytes reserved by packing.
    pub nused: usize,
    /// Record bytes actually copied at issue time.
    pub nfilled: usize,
    pub itxs: Vec<Itx>,
    pub waiters: Vec<Arc<CommitWaiter>>,
    /// Txg in which this lwb's block was allocated.
    pub alloc_txg: u64,
    /// Highest txg among the records packed into this lwb.
    pub max_txg: u64,
    pub issued_txg: u64,
    pub opened_at: Option<Instant>,
    pub issued_at: Option<Instant>,
    pub root_io: Option<Io>,
    pub write_io: Option<Io>,
    /// Grouping node for producer-issued indirect data writes.
    pub child_io: Option<Io>,
}

impl Lwb {
    pub fn new(
        id: u64,
        size: usize,
        slim: bool,
        blk: Option<BlockPointer>,
        state: LwbState,
        alloc_txg: u64,
    ) -> Arc<Lwb> {
        debug_assert!(size > TRAILER_LEN);
        debug_assert!(matches!(state, LwbState::New | LwbState::Opened));
        Arc::new(Lwb {
            id,
            inner: Mutex::new(LwbInner {
                state,
                slim,
                slog: false,
                blk,
                error: None,
                buf: vec![0; size],
                nused: 0,
                nfilled: 0,
                itxs: Vec::new(),
                waiters: Vec::new(),
                alloc_txg,
                max_txg: 0,
                issued_txg: 0,
                opened_at: if state == LwbState::Opened {
                    Some(Instant::now())
                } else {
                    None
                },
                issued_at: None,
                root_io: None,
                write_io: None,
                child_io: None,
            }),
            vdevs: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, LwbInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> LwbState {
        self.inner.lock().state
    }

    /// Record that `vdev` holds data this lwb is responsible for flushing.
    pub fn add_vdev(&self, vdev: u32) {
        self.vdevs.lock().insert(vdev);
    }

    /// Detach the flush set, e.g. to issue the flushes or to defer them.
    pub fn take_vdevs(&self) -> BTreeSet<u32> {
        std::mem::take(&mut *self.vdevs.lock())
    }

    /// Merge a predecessor's deferred flush set into this lwb's.
    pub fn merge_vdevs(&self, other: BTreeSet<u32>) {
        self.vdevs.lock().extend(other);
    }
}

impl LwbInner {
    /// Total buffer capacity.
    pub fn sz(&self) -> usize {
        self.buf.len()
    }

    /// Usable record capacity: both layouts reserve one trailer.
    pub fn nmax(&self) -> usize {
        self.sz() - TRAILER_LEN
    }

    /// Offset of the record region inside the buffer.
    pub fn records_start(&self) -> usize {
        if self.slim {
            TRAILER_LEN
        } else {
            0
        }
    }

    pub fn check_size_invariants(&self) {
        debug_assert!(self.nfilled <= self.nused);
        debug_assert!(self.nused <= self.nmax());
        debug_assert!(self.nmax() <= self.sz());
    }
}
