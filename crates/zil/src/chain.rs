//! On-disk log-block chain: block pointers, chain checksums, and the two
//! block trailer layouts.
//!
//! Every log block carries a trailer naming the next block in the chain and
//! the checksum words the block itself must match. The checksum words of
//! block N+1 are block N's words with the sequence incremented, so a torn or
//! stale block fails validation and terminates the walk. Chain breakage and
//! truncation are indistinguishable from checksum failure; that is the
//! end-of-chain signal.

use std::collections::BTreeSet;

use crate::error::EngineError;

/// Magic value identifying a block trailer. A byte-swapped magic marks a
/// block written on a foreign-endian host.
pub const TRAILER_MAGIC: u64 = 0x00c8_a14b_10c5_eed5;

/// Size of the encoded trailer, both layouts.
pub const TRAILER_LEN: usize = 120;

/// The checksum words carried in a block pointer and stored in the pointed-to
/// block's trailer.
///
/// A fresh chain starts from `{random, random, objset, seq=1}`; each link
/// advances `seq` by one and keeps the other words.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainChecksum {
    pub guid: [u64; 2],
    pub objset: u64,
    pub seq: u64,
}

impl ChainChecksum {
    pub const LEN: usize = 32;

    /// Seed for a brand-new chain on objset `objset`.
    pub fn new_chain(objset: u64) -> Self {
        Self {
            guid: [rand::random(), rand::random()],
            objset,
            seq: 1,
        }
    }

    /// The words expected of the next block in the chain.
    pub fn advance(mut self) -> Self {
        self.seq += 1;
        self
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.guid[0].to_le_bytes());
        out[8..16].copy_from_slice(&self.guid[1].to_le_bytes());
        out[16..24].copy_from_slice(&self.objset.to_le_bytes());
        out[24..32].copy_from_slice(&self.seq.to_le_bytes());
    }

    fn decode(buf: &[u8], swap: bool) -> Self {
        Self {
            guid: [get_u64(buf, 0, swap), get_u64(buf, 8, swap)],
            objset: get_u64(buf, 16, swap),
            seq: get_u64(buf, 24, swap),
        }
    }
}

/// Address of one log or data block in the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPointer {
    pub vdev: u32,
    /// Allocated size in bytes.
    pub size: u32,
    pub offset: u64,
    pub birth_txg: u64,
    /// `true` if the pointed-to block uses the slim layout (trailer first).
    pub slim: bool,
    pub cksum: ChainChecksum,
}

impl BlockPointer {
    pub const ENCODED_LEN: usize = 64;

    const FLAG_SLIM: u64 = 1;

    /// Encode `bp` at the start of `out`; `None` encodes as a hole (all
    /// zeroes).
    pub fn encode_opt(bp: Option<&BlockPointer>, out: &mut [u8]) {
        let out = &mut out[..Self::ENCODED_LEN];
        match bp {
            None => out.fill(0),
            Some(bp) => {
                out[0..4].copy_from_slice(&bp.vdev.to_le_bytes());
                out[4..8].copy_from_slice(&bp.size.to_le_bytes());
                out[8..16].copy_from_slice(&bp.offset.to_le_bytes());
                out[16..24].copy_from_slice(&bp.birth_txg.to_le_bytes());
                let flags = if bp.slim { Self::FLAG_SLIM } else { 0 };
                out[24..32].copy_from_slice(&flags.to_le_bytes());
                bp.cksum.encode_into(&mut out[32..64]);
            }
        }
    }

    /// Decode a block pointer; an all-zero encoding is a hole (`None`).
    pub fn decode_opt(buf: &[u8], swap: bool) -> Option<BlockPointer> {
        let buf = &buf[..Self::ENCODED_LEN];
        if buf.iter().all(|&b| b == 0) {
            return None;
        }
        let vdev = get_u32(buf, 0, swap);
        let size = get_u32(buf, 4, swap);
        let flags = get_u64(buf, 24, swap);
        Some(BlockPointer {
            vdev,
            size,
            offset: get_u64(buf, 8, swap),
            birth_txg: get_u64(buf, 16, swap),
            slim: flags & Self::FLAG_SLIM != 0,
            cksum: ChainChecksum::decode(&buf[32..64], swap),
        })
    }
}

/// A decoded, validated block trailer.
#[derive(Debug, PartialEq)]
pub struct OpenedBlock<'a> {
    /// The record bytes of the block (padding excluded).
    pub records: &'a [u8],
    /// The next block in the chain, or `None` at a chain that was never
    /// extended.
    pub next: Option<BlockPointer>,
    /// `true` if the block was written on a foreign-endian host.
    pub byteswap: bool,
}

/// Write the trailer (and payload crc) into `buf`, which holds a complete
/// block image. `nused` counts record bytes only; the caller has already
/// placed them after the trailer (slim) or at the start (legacy) and zeroed
/// any padding.
pub fn seal_block(
    buf: &mut [u8],
    slim: bool,
    nused: usize,
    next: Option<&BlockPointer>,
    cksum: ChainChecksum,
) {
    let size = buf.len();
    debug_assert!(nused <= size - TRAILER_LEN);

    let (records, tpos) = if slim {
        (TRAILER_LEN..TRAILER_LEN + nused, 0)
    } else {
        (0..nused, size - TRAILER_LEN)
    };
    let crc = crc32c::crc32c(&buf[records]);
    // Slim counts the trailer itself, legacy does not.
    let bytes_used = if slim { TRAILER_LEN + nused } else { nused } as u64;

    let t = &mut buf[tpos..tpos + TRAILER_LEN];
    t[0..8].copy_from_slice(&TRAILER_MAGIC.to_le_bytes());
    t[8..16].copy_from_slice(&bytes_used.to_le_bytes());
    BlockPointer::encode_opt(next, &mut t[16..80]);
    cksum.encode_into(&mut t[80..112]);
    t[112..116].copy_from_slice(&crc.to_le_bytes());
    t[116..120].fill(0);
}

/// Validate and open a block image read back from `bp`.
///
/// Any mismatch (magic, layout bounds, chain checksum words, or payload
/// crc) yields [`EngineError::Checksum`], the ordinary end-of-chain signal.
pub fn open_block<'a>(buf: &'a [u8], bp: &BlockPointer) -> Result<OpenedBlock<'a>, EngineError> {
    if buf.len() != bp.size as usize || buf.len() < TRAILER_LEN {
        return Err(EngineError::Checksum);
    }
    let tpos = if bp.slim { 0 } else { buf.len() - TRAILER_LEN };
    let t = &buf[tpos..tpos + TRAILER_LEN];

    let magic = get_u64(t, 0, false);
    let swap = match magic {
        TRAILER_MAGIC => false,
        m if m == TRAILER_MAGIC.swap_bytes() => true,
        _ => return Err(EngineError::Checksum),
    };

    let bytes_used = get_u64(t, 8, swap) as usize;
    let records = if bp.slim {
        if bytes_used < TRAILER_LEN || bytes_used > buf.len() {
            return Err(EngineError::Checksum);
        }
        &buf[TRAILER_LEN..bytes_used]
    } else {
        if bytes_used > buf.len() - TRAILER_LEN {
            return Err(EngineError::Checksum);
        }
        &buf[..bytes_used]
    };

    let stored = ChainChecksum::decode(&t[80..112], swap);
    if stored != bp.cksum {
        return Err(EngineError::Checksum);
    }
    let crc = get_u32(t, 112, swap);
    if crc != crc32c::crc32c(records) {
        return Err(EngineError::Checksum);
    }

    Ok(OpenedBlock {
        records,
        next: BlockPointer::decode_opt(&t[16..80], swap),
        byteswap: swap,
    })
}

bitflags::bitflags! {
    /// Flags stored in the on-disk header.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HeaderFlags: u64 {
        /// A claimed chain exists and must be replayed before use.
        const REPLAY_NEEDED = 1 << 0;
        /// `claim_lr_seq` was recorded by claim and bounds record walks.
        const CLAIM_LR_SEQ_VALID = 1 << 1;
    }
}

/// The per-dataset log header stored in the dataset metadata. Points at the
/// first block of the chain and carries claim/replay progress.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ZilHeader {
    /// Txg in which the chain was claimed at import; zero if unclaimed.
    pub claim_txg: u64,
    /// Highest record sequence already replayed.
    pub replay_seq: u64,
    /// First block of the chain, or `None` if there is no chain.
    pub log: Option<BlockPointer>,
    /// Highest block sequence seen by claim.
    pub claim_blk_seq: u64,
    /// Highest record sequence seen by claim.
    pub claim_lr_seq: u64,
    pub flags: HeaderFlags,
}

/// Dedup set of block addresses already seen during a chain walk, so claim
/// and free are idempotent under retry.
#[derive(Debug, Default)]
pub struct BpTree(BTreeSet<(u32, u64)>);

impl BpTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bp`; returns `false` if it was already present.
    pub fn insert(&mut self, bp: &BlockPointer) -> bool {
        self.0.insert((bp.vdev, bp.offset))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn get_u64(buf: &[u8], off: usize, swap: bool) -> u64 {
    let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn get_u32(buf: &[u8], off: usize, swap: bool) -> u32 {
    let v = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}
