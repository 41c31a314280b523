//! A per-dataset intent log: a write-ahead log of filesystem-modifying
//! operations, durably chained through self-validating blocks so it can be
//! claimed and replayed after a crash.
//!
//! The in-memory commit pipeline accumulates intent transactions
//! ([`record::Itx`]), batches them into variable-sized log write blocks,
//! issues those blocks as a linked on-disk chain in strictly ordered
//! fashion, and wakes synchronous [`Zilog::commit`] callers exactly when
//! the data they care about is durable. The block store, allocator, and
//! txg manager are external collaborators behind [`engine::BlockEngine`].

pub mod chain;
pub mod engine;
pub mod error;
pub mod itxg;
pub mod lwb;
pub mod parse;
pub mod record;
pub mod replay;
pub mod waiter;
pub mod zilog;

pub use crate::{
    chain::{BlockPointer, ChainChecksum, HeaderFlags, ZilHeader},
    engine::{BlockEngine, GetData, Io, IoPriority},
    error::{EngineError, ReplayError, SuspendError},
    record::{Itx, LrHeader, LrWrite, TxType, WriteState},
    replay::{ReplayFn, ReplayTable},
    waiter::CommitWaiter,
    zilog::{LogBias, SyncPolicy, ZilStats, Zilog},
};

#[cfg(test)]
mod tests;

/// Slots in the per-txg rings (itx groups, inflight counters).
pub const TXG_SIZE: usize = 4;

/// Txgs that can be in flight (open, quiescing, syncing) at once.
pub const TXG_CONCURRENT_STATES: usize = 3;

/// History depth of the block-size predictor.
pub const ZIL_BURSTS: usize = 8;

/// Log blocks are sized in multiples of this.
pub const ZIL_MIN_BLKSZ: usize = 4096;

/// Txg itxs are assigned to when the pool is frozen for log testing.
pub const ZILTEST_TXG: u64 = u64::MAX - TXG_CONCURRENT_STATES as u64;

/// [`Zilog`] tunables.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Percentage of the observed lwb latency a `commit` caller waits
    /// before closing and issuing the open block itself.
    ///
    /// Default: 5
    pub commit_timeout_pct: u32,
    /// Skip replay at import. Recovery hazard: claimed records are
    /// discarded unapplied.
    ///
    /// Default: `false`
    pub replay_disable: bool,
    /// Skip vdev cache flushes. Durability hazard on devices with volatile
    /// write caches.
    ///
    /// Default: `false`
    pub nocacheflush: bool,
    /// Burst bytes above which writes to a dedicated log device are demoted
    /// to asynchronous priority.
    ///
    /// Default: 768 KiB
    pub slog_bulk: u64,
    /// Cap on the size of a log write block.
    ///
    /// Default: 128 KiB
    pub max_block_size: usize,
    /// Cap on the payload of a `WR_COPIED` record.
    ///
    /// Default: 7680
    pub max_copied_data: usize,
    /// Writes below this size prefer inline payloads over indirect blocks.
    ///
    /// Default: 32 KiB
    pub immediate_write_sz: usize,
    /// Treat "special" vdevs as log devices for sizing decisions.
    ///
    /// Default: `false`
    pub special_is_slog: bool,
    /// Write the slim block layout (trailer first). Tests use `false` to
    /// exercise the legacy trailer-last layout.
    ///
    /// Default: `true`
    pub slim: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            commit_timeout_pct: 5,
            replay_disable: false,
            nocacheflush: false,
            slog_bulk: 768 * 1024,
            max_block_size: 128 * 1024,
            max_copied_data: 7680,
            immediate_write_sz: 32 * 1024,
            special_is_slog: false,
            slim: true,
        }
    }
}
