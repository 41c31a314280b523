//! Log records and in-memory intent transactions (itxs).
//!
//! Every record starts with a fixed [`LrHeader`]; the remainder is a
//! type-specific body the core treats as opaque, except for `TX_WRITE` and
//! `TX_CLONE_RANGE`, whose block pointers the claim/free/issue paths must
//! see. Record lengths are rounded up to 8 bytes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::chain::BlockPointer;
use crate::waiter::CommitWaiter;

/// Bit set on a record's `txtype` for case-insensitive name operations.
/// Stripped before dispatch.
pub const TX_CI: u64 = 1 << 63;

/// Record types. The numeric values are the on-disk tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u64)]
pub enum TxType {
    Create = 1,
    Mkdir = 2,
    Mkxattr = 3,
    Symlink = 4,
    Remove = 5,
    Rmdir = 6,
    Link = 7,
    Rename = 8,
    Write = 9,
    Truncate = 10,
    Setattr = 11,
    AclV0 = 12,
    Acl = 13,
    CreateAcl = 14,
    CreateAttr = 15,
    CreateAclAttr = 16,
    MkdirAcl = 17,
    MkdirAttr = 18,
    MkdirAclAttr = 19,
    Write2 = 20,
    Setsaxattr = 21,
    RenameExchange = 22,
    RenameWhiteout = 23,
    CloneRange = 24,
    /// In-memory only: carries a commit waiter through the pipeline and is
    /// never written to disk.
    Commit = 25,
}

/// One past the largest on-disk record type.
pub const TX_MAX_TYPE: u64 = 25;

impl TxType {
    /// Decode an on-disk tag, ignoring the case-insensitivity bit. `Commit`
    /// is not a valid on-disk tag.
    pub fn from_disk(raw: u64) -> Option<TxType> {
        use TxType::*;
        Some(match raw & !TX_CI {
            1 => Create,
            2 => Mkdir,
            3 => Mkxattr,
            4 => Symlink,
            5 => Remove,
            6 => Rmdir,
            7 => Link,
            8 => Rename,
            9 => Write,
            10 => Truncate,
            11 => Setattr,
            12 => AclV0,
            13 => Acl,
            14 => CreateAcl,
            15 => CreateAttr,
            16 => CreateAclAttr,
            17 => MkdirAcl,
            18 => MkdirAttr,
            19 => MkdirAclAttr,
            20 => Write2,
            21 => Setsaxattr,
            22 => RenameExchange,
            23 => RenameWhiteout,
            24 => CloneRange,
            _ => return None,
        })
    }

    /// Record types that may legally be replayed against an object that no
    /// longer exists (the object was removed later in the chain).
    pub fn out_of_order(self) -> bool {
        use TxType::*;
        matches!(
            self,
            Write | Truncate | Setattr | AclV0 | Acl | Write2 | Setsaxattr
        )
    }

    fn is_rename(self) -> bool {
        use TxType::*;
        matches!(self, Rename | RenameExchange | RenameWhiteout)
    }
}

/// Round up to the record alignment (8 bytes).
pub(crate) fn p2roundup(n: usize) -> usize {
    (n + 7) & !7
}

/// The fixed header every record starts with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LrHeader {
    /// On-disk tag, possibly with [`TX_CI`] set.
    pub txtype: u64,
    /// Total record length including this header, 8-byte aligned.
    pub reclen: u64,
    /// Transaction group the operation was assigned to.
    pub txg: u64,
    /// Chain-unique, strictly increasing record sequence number.
    pub seq: u64,
}

impl LrHeader {
    pub const LEN: usize = 32;

    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.txtype.to_le_bytes());
        out[8..16].copy_from_slice(&self.reclen.to_le_bytes());
        out[16..24].copy_from_slice(&self.txg.to_le_bytes());
        out[24..32].copy_from_slice(&self.seq.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> LrHeader {
        LrHeader {
            txtype: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            reclen: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            txg: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            seq: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }

    pub fn txtype(&self) -> Option<TxType> {
        TxType::from_disk(self.txtype)
    }
}

/// How a `TX_WRITE` record carries its payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteState {
    /// The payload is inline in the record, fetched at itx creation.
    Copied,
    /// The payload is inline, but fetched from the DMU at issue time; may be
    /// split across log blocks.
    NeedCopy,
    /// The record carries only a block pointer; the payload block is written
    /// by the producer as a child I/O of the log write.
    Indirect,
}

/// Structured view of a `TX_WRITE` record body (the bytes after the header).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LrWrite {
    pub foid: u64,
    pub offset: u64,
    pub length: u64,
    pub blkptr: Option<BlockPointer>,
}

impl LrWrite {
    /// Body length without inline payload.
    pub const BODY_LEN: usize = 24 + BlockPointer::ENCODED_LEN;
    /// Full record length without inline payload.
    pub const LEN: usize = LrHeader::LEN + Self::BODY_LEN;

    pub fn read(body: &[u8]) -> LrWrite {
        LrWrite {
            foid: u64::from_le_bytes(body[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(body[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(body[16..24].try_into().unwrap()),
            blkptr: BlockPointer::decode_opt(&body[24..24 + BlockPointer::ENCODED_LEN], false),
        }
    }

    pub fn write_into(&self, body: &mut [u8]) {
        body[0..8].copy_from_slice(&self.foid.to_le_bytes());
        body[8..16].copy_from_slice(&self.offset.to_le_bytes());
        body[16..24].copy_from_slice(&self.length.to_le_bytes());
        BlockPointer::encode_opt(
            self.blkptr.as_ref(),
            &mut body[24..24 + BlockPointer::ENCODED_LEN],
        );
    }
}

/// Structured view of a `TX_CLONE_RANGE` record body: a run of block
/// pointers shared into the target range.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LrCloneRange {
    pub foid: u64,
    pub offset: u64,
    pub length: u64,
    pub blksz: u64,
    pub bps: Vec<BlockPointer>,
}

impl LrCloneRange {
    /// Body length without the block pointer run.
    pub const BASE_BODY_LEN: usize = 40;

    pub fn read(body: &[u8]) -> LrCloneRange {
        let nbps = u64::from_le_bytes(body[32..40].try_into().unwrap()) as usize;
        // A lying count must not read past the record.
        let nbps = nbps.min((body.len() - Self::BASE_BODY_LEN) / BlockPointer::ENCODED_LEN);
        let mut bps = Vec::with_capacity(nbps);
        for i in 0..nbps {
            let at = Self::BASE_BODY_LEN + i * BlockPointer::ENCODED_LEN;
            if let Some(bp) = BlockPointer::decode_opt(&body[at..at + BlockPointer::ENCODED_LEN], false)
            {
                bps.push(bp);
            }
        }
        LrCloneRange {
            foid: u64::from_le_bytes(body[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(body[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(body[16..24].try_into().unwrap()),
            blksz: u64::from_le_bytes(body[24..32].try_into().unwrap()),
            bps,
        }
    }

    pub fn write_into(&self, body: &mut [u8]) {
        body[0..8].copy_from_slice(&self.foid.to_le_bytes());
        body[8..16].copy_from_slice(&self.offset.to_le_bytes());
        body[16..24].copy_from_slice(&self.length.to_le_bytes());
        body[24..32].copy_from_slice(&self.blksz.to_le_bytes());
        body[32..40].copy_from_slice(&(self.bps.len() as u64).to_le_bytes());
        for (i, bp) in self.bps.iter().enumerate() {
            let at = Self::BASE_BODY_LEN + i * BlockPointer::ENCODED_LEN;
            BlockPointer::encode_opt(Some(bp), &mut body[at..at + BlockPointer::ENCODED_LEN]);
        }
    }

    pub fn encoded_body_len(nbps: usize) -> usize {
        Self::BASE_BODY_LEN + nbps * BlockPointer::ENCODED_LEN
    }
}

/// Byteswap a full record image in place so it reads as native-endian.
///
/// Only the header and the `TX_WRITE` body are word-swapped; other bodies
/// are interpreted solely by the replay functions, which receive the
/// byteswap flag. `TX_CLONE_RANGE` bodies are intentionally left alone.
pub fn byteswap_record(rec: &mut [u8]) {
    let raw = u64::from_le_bytes(rec[0..8].try_into().unwrap()).swap_bytes();
    for w in rec[..LrHeader::LEN].chunks_exact_mut(8) {
        w.reverse();
    }
    if TxType::from_disk(raw) == Some(TxType::Write) && rec.len() >= LrWrite::LEN {
        for w in rec[LrHeader::LEN..LrWrite::LEN].chunks_exact_mut(8) {
            w.reverse();
        }
    }
}

/// A single operation to be durably logged.
pub struct Itx {
    pub(crate) hdr: LrHeader,
    /// Record body (everything after the header), padded to 8 bytes.
    pub(crate) body: Vec<u8>,
    /// Write payload placement; `None` for non-write records.
    pub(crate) wr_state: Option<WriteState>,
    /// `false` queues the itx on the per-object async tree instead of the
    /// sync list.
    pub sync: bool,
    /// Owning object id, for async bucketing and rename/remove ordering.
    pub oid: u64,
    /// Per-itx generation, handed back to the producer's `get_data`.
    pub gen: u64,
    /// Producer-private data handed back through `get_data`. Shared between
    /// the fragments of a split record.
    pub(crate) private: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) waiter: Option<Arc<CommitWaiter>>,
    pub(crate) callback: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Itx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Itx")
            .field("hdr", &self.hdr)
            .field("wr_state", &self.wr_state)
            .field("sync", &self.sync)
            .field("oid", &self.oid)
            .finish_non_exhaustive()
    }
}

impl Itx {
    /// Allocate an itx whose record is `lr_size` bytes including the header.
    /// The body is zeroed; `reclen` is rounded up to 8 bytes.
    pub fn create(txtype: TxType, lr_size: usize) -> Itx {
        assert!(lr_size >= LrHeader::LEN);
        let reclen = p2roundup(lr_size);
        Itx {
            hdr: LrHeader {
                txtype: txtype as u64,
                reclen: reclen as u64,
                txg: 0,
                seq: 0,
            },
            body: vec![0; reclen - LrHeader::LEN],
            wr_state: if txtype == TxType::Write {
                Some(WriteState::Copied)
            } else {
                None
            },
            sync: true,
            oid: 0,
            gen: 0,
            private: None,
            waiter: None,
            callback: None,
        }
    }

    pub fn txtype(&self) -> TxType {
        self.hdr.txtype().expect("in-memory itx has a valid txtype")
    }

    pub(crate) fn is_commit(&self) -> bool {
        self.txtype() == TxType::Commit
    }

    pub(crate) fn is_rename(&self) -> bool {
        self.txtype().is_rename()
    }

    pub fn set_wr_state(&mut self, state: WriteState) {
        debug_assert_eq!(self.txtype(), TxType::Write);
        self.wr_state = Some(state);
    }

    pub fn set_callback(&mut self, cb: Box<dyn FnOnce() + Send>) {
        self.callback = Some(cb);
    }

    pub fn set_private(&mut self, private: Arc<dyn Any + Send + Sync>) {
        self.private = Some(private);
    }

    pub fn lr_write(&self) -> LrWrite {
        debug_assert_eq!(self.txtype(), TxType::Write);
        LrWrite::read(&self.body)
    }

    pub fn set_lr_write(&mut self, lrw: &LrWrite) {
        debug_assert_eq!(self.txtype(), TxType::Write);
        lrw.write_into(&mut self.body);
    }

    /// Payload bytes fetched at issue time, 8-byte padded. Nonzero only for
    /// `WR_NEED_COPY` records.
    pub(crate) fn dlen(&self) -> usize {
        match self.wr_state {
            Some(WriteState::NeedCopy) => p2roundup(self.lr_write().length as usize),
            _ => 0,
        }
    }

    /// Bytes this itx will occupy in a log block.
    pub(crate) fn full_size(&self) -> usize {
        self.hdr.reclen as usize + self.dlen()
    }
}

impl Drop for Itx {
    fn drop(&mut self) {
        // The callback contract: invoked exactly once, when the itx is
        // destroyed, wherever that happens.
        if let Some(cb) = self.callback.take() {
            cb();
        }
        // A commit itx destroyed before its waiter was linked to an lwb
        // (e.g. swept up by `clean` during a suspend race) must not strand
        // the waiting thread: nothing needed to be written on its behalf.
        if let Some(w) = self.waiter.take() {
            if !w.is_done() {
                w.skip();
            }
        }
    }
}
