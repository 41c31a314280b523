//! External collaborators of the intent log: the block store / allocator /
//! txg manager behind [`BlockEngine`], and the producer's byte-range
//! provider behind [`GetData`].
//!
//! The traits exist mainly to allow testing against an in-memory pool; a
//! real deployment wires them to its storage engine.

use std::any::Any;

use crate::chain::{BlockPointer, ZilHeader};
use crate::error::EngineError;
use crate::record::LrWrite;

pub mod io;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use io::{Io, IoRuntime};
#[cfg(any(test, feature = "test"))]
pub use mem::Memory;

/// Priority of a log-block write. Bulk bursts are demoted so they do not
/// starve latency-sensitive writers on a shared log device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoPriority {
    SyncWrite,
    AsyncWrite,
}

/// The pool-side surface the intent log runs against: block storage,
/// log-block allocation, claim/free accounting, and the txg manager.
///
/// All methods are synchronous; asynchrony and ordering live in the
/// [`io`] dependency graph layered on top.
pub trait BlockEngine: Send + Sync + 'static {
    /// Id of the objset this log belongs to; seeds fresh chain checksums.
    fn objset(&self) -> u64;

    fn writable(&self) -> bool {
        true
    }

    /// A frozen pool never syncs; itxs are assigned to the test txg.
    fn frozen(&self) -> bool {
        false
    }

    /// The operator asked for all intent logs to be discarded at import.
    fn log_clear_requested(&self) -> bool {
        false
    }

    /// The pool is rewound to a checkpoint; unclaimed chains are discarded.
    fn checkpointed(&self) -> bool {
        false
    }

    fn encrypted(&self) -> bool {
        false
    }

    fn key_available(&self) -> bool {
        true
    }

    /// DMU-level object existence, consulted when replaying out-of-order
    /// record types.
    fn object_exists(&self, _oid: u64) -> bool {
        true
    }

    /// Load the dataset's log header.
    fn load_header(&self) -> ZilHeader;

    /// Stage the dataset's log header for `txg`.
    fn store_header(&self, hdr: &ZilHeader, txg: u64);

    /// Allocate a log block of `size` bytes, preferring a dedicated log
    /// device when `use_slog` is set. `prev` hints allocator locality.
    fn alloc_log_block(
        &self,
        txg: u64,
        size: u64,
        prev: Option<&BlockPointer>,
        use_slog: bool,
    ) -> Result<BlockPointer, EngineError>;

    /// Speculatively reserve `bp` at import so the allocator cannot reuse it
    /// until replay decides its fate. Idempotent.
    fn claim_block(&self, txg: u64, bp: &BlockPointer) -> Result<(), EngineError>;

    /// Register a pending block reference for a cloned range found during
    /// claim.
    fn clone_ref_add(&self, _txg: u64, _bp: &BlockPointer) -> Result<(), EngineError> {
        Ok(())
    }

    /// Release `bp` back to the allocator.
    fn free_block(&self, txg: u64, bp: &BlockPointer);

    /// Read back a block. Unwritten or lost regions read as zeroes, exactly
    /// like raw disk, so chain validation terminates the walk.
    fn read_block(&self, bp: &BlockPointer) -> Result<Vec<u8>, EngineError>;

    /// Write a block image. Completion does not imply durability until the
    /// vdev's cache is flushed.
    fn write_block(
        &self,
        bp: &BlockPointer,
        data: &[u8],
        prio: IoPriority,
    ) -> Result<(), EngineError>;

    /// Flush the write cache of `vdev`.
    fn flush_vdev(&self, vdev: u32) -> Result<(), EngineError>;

    fn vdev_is_log(&self, _vdev: u32) -> bool {
        false
    }

    /// Whether `vdev` belongs to the "special" allocation class, which some
    /// configurations treat like a log device for sizing.
    fn vdev_is_special(&self, _vdev: u32) -> bool {
        false
    }

    /// Hold the currently open txg open and return it.
    fn txg_hold(&self) -> u64;

    fn txg_rele(&self, txg: u64);

    /// Block until `txg` (or, for zero, everything open at the time of the
    /// call) has synced to the main pool.
    fn txg_wait_synced(&self, txg: u64);

    fn last_synced_txg(&self) -> u64;
}

/// Producer contract for fetching `TX_WRITE` payloads at issue time.
pub trait GetData: Send + Sync + 'static {
    /// Fill `buf` with the record's payload (`WR_COPIED` / `WR_NEED_COPY`).
    /// When `buf` is `None` (`WR_INDIRECT`), write the payload block
    /// directly instead, store its pointer in `lr`, and attach the data
    /// write as a child of `child_io` (present for indirect calls only; see
    /// [`Io::child_op`]).
    ///
    /// Errors: `Io` forces the caller back to `txg_wait_synced`; `NotFound`,
    /// `Exists` and `Already` mean the object is gone or the range already
    /// reached the main pool, and the record is skipped silently.
    fn get_data(
        &self,
        private: Option<&(dyn Any + Send + Sync)>,
        gen: u64,
        lr: &mut LrWrite,
        buf: Option<&mut [u8]>,
        child_io: Option<&Io>,
    ) -> Result<(), EngineError>;
}

/// A provider for logs that never carry write payloads (tests, metadata-only
/// producers).
pub struct NoData;

impl GetData for NoData {
    fn get_data(
        &self,
        _private: Option<&(dyn Any + Send + Sync)>,
        _gen: u64,
        _lr: &mut LrWrite,
        _buf: Option<&mut [u8]>,
        _child_io: Option<&Io>,
    ) -> Result<(), EngineError> {
        Err(EngineError::NotFound)
    }
}
