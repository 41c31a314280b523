//! Shared scaffolding: an in-memory pool wired to a zilog, and a miniature
//! filesystem acting as both the producer (`GetData`) and the replay
//! target.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::BlockPointer;
use crate::engine::{BlockEngine, GetData, Io, Memory};
use crate::error::EngineError;
use crate::record::{Itx, LrHeader, LrWrite, TxType, WriteState};
use crate::replay::ReplayTable;
use crate::zilog::Zilog;
use crate::Options;

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

pub type Files = BTreeMap<u64, Vec<u8>>;

/// A miniature filesystem: object id to contents. Writes are applied here
/// first (the "DMU"), then logged; `get_data` reads payloads back out.
#[derive(Clone)]
pub struct TestFs(Arc<FsInner>);

struct FsInner {
    engine: Memory,
    files: Mutex<Files>,
    /// The files as of the last txg sync: what the main pool would hold
    /// after a crash.
    synced: Mutex<Files>,
    fail_next: Mutex<Option<EngineError>>,
    gen: AtomicU64,
}

impl TestFs {
    pub fn new(engine: Memory) -> TestFs {
        TestFs(Arc::new(FsInner {
            engine,
            files: Mutex::new(Files::new()),
            synced: Mutex::new(Files::new()),
            fail_next: Mutex::new(None),
            gen: AtomicU64::new(1),
        }))
    }

    /// Apply a write to the filesystem and log it, choosing the write state
    /// the way a producer would from the zilog's thresholds.
    pub fn write(
        &self,
        zilog: &Arc<Zilog<Memory>>,
        foid: u64,
        offset: usize,
        data: &[u8],
        sync: bool,
    ) {
        let state = if data.len() >= zilog.options().immediate_write_sz {
            WriteState::Indirect
        } else if data.len() <= zilog.max_copied_data() {
            WriteState::Copied
        } else {
            WriteState::NeedCopy
        };
        self.write_as(zilog, foid, offset, data, sync, state);
    }

    /// Like [`Self::write`], with the write state forced.
    pub fn write_as(
        &self,
        zilog: &Arc<Zilog<Memory>>,
        foid: u64,
        offset: usize,
        data: &[u8],
        sync: bool,
        state: WriteState,
    ) {
        {
            let mut files = self.0.files.lock();
            let f = files.entry(foid).or_default();
            if f.len() < offset + data.len() {
                f.resize(offset + data.len(), 0);
            }
            f[offset..offset + data.len()].copy_from_slice(data);
        }

        let lr_size = match state {
            WriteState::Copied => LrWrite::LEN + data.len(),
            _ => LrWrite::LEN,
        };
        let mut itx = Itx::create(TxType::Write, lr_size);
        itx.set_wr_state(state);
        itx.set_lr_write(&LrWrite {
            foid,
            offset: offset as u64,
            length: data.len() as u64,
            blkptr: None,
        });
        itx.sync = sync;
        itx.oid = foid;
        itx.gen = self.0.gen.fetch_add(1, Ordering::Relaxed);
        self.assign(zilog, itx);
    }

    /// Log a rename involving `foid` (payload irrelevant to the core).
    pub fn rename(&self, zilog: &Arc<Zilog<Memory>>, foid: u64) {
        self.rename_as(zilog, foid, TxType::Rename);
    }

    /// Like [`Self::rename`], for any of the rename-family record types.
    pub fn rename_as(&self, zilog: &Arc<Zilog<Memory>>, foid: u64, txtype: TxType) {
        assert!(matches!(
            txtype,
            TxType::Rename | TxType::RenameExchange | TxType::RenameWhiteout
        ));
        let mut itx = Itx::create(txtype, LrHeader::LEN + 16);
        itx.oid = foid;
        self.assign(zilog, itx);
    }

    /// Log a remove of `foid`, purging its pending async itxs.
    pub fn remove(&self, zilog: &Arc<Zilog<Memory>>, foid: u64) {
        self.0.files.lock().remove(&foid);
        let mut itx = Itx::create(TxType::Remove, LrHeader::LEN + 8);
        itx.oid = foid;
        itx.body[..8].copy_from_slice(&foid.to_le_bytes());
        self.assign(zilog, itx);
    }

    fn assign(&self, zilog: &Arc<Zilog<Memory>>, itx: Itx) {
        let txg = self.0.engine.txg_hold();
        zilog.itx_assign(itx, txg);
        self.0.engine.txg_rele(txg);
    }

    /// Fail the next `get_data` call with `e`.
    pub fn fail_next_get_data(&self, e: EngineError) {
        *self.0.fail_next.lock() = Some(e);
    }

    pub fn files(&self) -> Files {
        self.0.files.lock().clone()
    }

    pub fn on_txg_sync(&self, _txg: u64) {
        *self.0.synced.lock() = self.0.files.lock().clone();
    }

    /// Power loss: the filesystem falls back to its last synced state.
    pub fn revert_to_synced(&self) {
        *self.0.files.lock() = self.0.synced.lock().clone();
    }
}

impl GetData for TestFs {
    fn get_data(
        &self,
        _private: Option<&(dyn Any + Send + Sync)>,
        _gen: u64,
        lr: &mut LrWrite,
        buf: Option<&mut [u8]>,
        child_io: Option<&Io>,
    ) -> Result<(), EngineError> {
        if let Some(e) = self.0.fail_next.lock().take() {
            return Err(e);
        }
        let data = {
            let files = self.0.files.lock();
            let f = files.get(&lr.foid).ok_or(EngineError::NotFound)?;
            let off = lr.offset as usize;
            let len = lr.length as usize;
            let mut out = vec![0u8; len];
            let have = f.len().saturating_sub(off).min(len);
            out[..have].copy_from_slice(&f[off..off + have]);
            out
        };
        match buf {
            Some(buf) => {
                buf[..data.len()].copy_from_slice(&data);
            }
            None => {
                // Indirect: the payload goes straight into the main pool,
                // hung off the lwb's child slot.
                let txg = self.0.engine.current_open_txg();
                let bp = self.0.engine.put_data_block(txg, &data);
                lr.blkptr = Some(bp);
                if let Some(slot) = child_io {
                    slot.child_op(Box::new(|| Ok(()))).nowait();
                }
            }
        }
        Ok(())
    }
}

/// An in-memory pool, a filesystem, and a zilog wired together.
pub struct Harness {
    pub mem: Arc<Memory>,
    pub fs: TestFs,
    pub zilog: Arc<Zilog<Memory>>,
}

pub fn harness() -> Harness {
    harness_with(Options::default(), 1)
}

pub fn harness_with(opts: Options, nlog: usize) -> Harness {
    enable_logging();
    let mem = Arc::new(Memory::new(54, 1, nlog));
    let fs = TestFs::new((*mem).clone());
    let zilog = Zilog::with_options(Arc::clone(&mem), fs.clone(), opts);
    register_hooks(&mem, &zilog, &fs);
    Harness { mem, fs, zilog }
}

fn register_hooks(mem: &Arc<Memory>, zilog: &Arc<Zilog<Memory>>, fs: &TestFs) {
    let sync_z = Arc::downgrade(zilog);
    let sync_fs = fs.clone();
    let clean_z = Arc::downgrade(zilog);
    mem.set_txg_hooks(
        move |txg| {
            if let Some(z) = sync_z.upgrade() {
                z.sync(txg);
            }
            sync_fs.on_txg_sync(txg);
        },
        move |txg| {
            if let Some(z) = clean_z.upgrade() {
                z.clean(txg);
            }
        },
    );
}

impl Harness {
    /// Establish the chain so subsequent commits log records rather than
    /// being satisfied by the chain-creation sync.
    pub fn warm(&self) {
        self.fs.write(&self.zilog, 1, 0, &[1; 64], true);
        self.zilog.commit(1);
    }

    /// Power-loss and reimport: volatile caches are dropped, the
    /// filesystem reverts to its synced state, and a fresh zilog is opened
    /// over the surviving pool.
    pub fn crash_and_reopen(&mut self) {
        self.mem.crash();
        self.fs.revert_to_synced();
        let zilog = Zilog::with_options(Arc::clone(&self.mem), self.fs.clone(), *self.zilog.options());
        register_hooks(&self.mem, &zilog, &self.fs);
        self.zilog = zilog;
    }

    /// Import-time claim of whatever chain the header names.
    pub fn claim(&self) {
        self.zilog
            .claim(self.mem.current_open_txg())
            .expect("claim failed");
    }
}

/// All records currently on the on-disk chain, in chain order.
pub fn chain_records(zilog: &Arc<Zilog<Memory>>) -> Vec<(LrHeader, Vec<u8>)> {
    let mut out = Vec::new();
    zilog
        .parse(
            |_, _| Ok(()),
            |_, lrh, rec, _| {
                out.push((*lrh, rec.to_vec()));
                Ok(())
            },
            0,
            false,
        )
        .expect("chain walk failed");
    out
}

/// The write records on the chain, as `(header, lr_write, inline payload)`.
pub fn chain_writes(zilog: &Arc<Zilog<Memory>>) -> Vec<(LrHeader, LrWrite, Vec<u8>)> {
    chain_records(zilog)
        .into_iter()
        .filter(|(h, _)| h.txtype() == Some(TxType::Write))
        .map(|(h, rec)| {
            let lrw = LrWrite::read(&rec[LrHeader::LEN..]);
            let data = rec[LrWrite::LEN.min(rec.len())..].to_vec();
            (h, lrw, data)
        })
        .collect()
}

/// All block pointers of the on-disk chain, in chain order.
pub fn chain_blocks(zilog: &Arc<Zilog<Memory>>) -> Vec<BlockPointer> {
    let mut out = Vec::new();
    zilog
        .parse(
            |_, bp| {
                out.push(*bp);
                Ok(())
            },
            |_, _, _, _| Ok(()),
            0,
            false,
        )
        .expect("chain walk failed");
    out
}

/// The replay dispatch used by recovery tests: applies records to a
/// [`Files`] map.
pub fn replay_table() -> ReplayTable<Files> {
    let mut table = ReplayTable::new();
    table.set(TxType::Write, |files: &mut Files, rec, _swap| {
        let lrw = LrWrite::read(&rec[LrHeader::LEN..]);
        let len = lrw.length as usize;
        if rec.len() < LrWrite::LEN + len {
            // The payload never made it (skipped indirect); nothing to do.
            return Ok(());
        }
        let data = &rec[LrWrite::LEN..LrWrite::LEN + len];
        let off = lrw.offset as usize;
        let f = files.entry(lrw.foid).or_default();
        if f.len() < off + len {
            f.resize(off + len, 0);
        }
        f[off..off + len].copy_from_slice(data);
        Ok(())
    });
    table.set(TxType::Remove, |files, rec, _swap| {
        let foid = u64::from_le_bytes(rec[LrHeader::LEN..LrHeader::LEN + 8].try_into().unwrap());
        files.remove(&foid);
        Ok(())
    });
    table.set(TxType::Rename, |_, _, _| Ok(()));
    table
}
