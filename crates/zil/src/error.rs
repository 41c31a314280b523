use thiserror::Error;

use crate::record::TxType;

/// Error codes surfaced by the block engine and the data provider.
///
/// These are deliberately small and copyable: they travel through I/O
/// completion callbacks into commit waiters, and the pipeline dispatches
/// on them (a checksum mismatch terminates a chain walk, an allocation
/// failure stalls the writer, and so on).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EngineError {
    /// Checksum mismatch, or the end of a log-block chain.
    #[error("checksum mismatch")]
    Checksum,
    /// The allocator could not provide a log block.
    #[error("no space for log block")]
    NoSpace,
    /// An I/O error on read, write, or flush.
    #[error("i/o error")]
    Io,
    /// The referenced object does not exist.
    #[error("object not found")]
    NotFound,
    /// The referenced range was already overwritten.
    #[error("block already exists")]
    Exists,
    /// The data is already in its final location.
    #[error("write already applied")]
    Already,
    /// The encryption key for the dataset is not loaded.
    #[error("key unavailable")]
    Access,
    /// The resource is busy.
    #[error("busy")]
    Busy,
}

/// Error returned by [`crate::Zilog::suspend`].
#[derive(Debug, Error)]
pub enum SuspendError {
    /// The on-disk chain has not been replayed; import normally first.
    #[error("intent log must be replayed before it can be suspended")]
    ReplayNeeded,
    /// The dataset is encrypted and its key is not loaded.
    #[error("encryption key unavailable")]
    KeyUnavailable,
}

/// Error produced while replaying a chain.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unexpected record type {txtype} at seq {seq}")]
    UnknownTxType { txtype: u64, seq: u64 },
    #[error("no replay function registered for {txtype:?}")]
    Unhandled { txtype: TxType, seq: u64 },
    #[error("replay of {txtype:?} record at seq {seq} failed")]
    Dispatch {
        txtype: TxType,
        seq: u64,
        #[source]
        source: EngineError,
    },
    #[error("chain walk failed during replay")]
    Parse(#[source] EngineError),
}
