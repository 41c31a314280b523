//! In-memory implementation of [`BlockEngine`]: a miniature pool with
//! vdevs, volatile write caches, a bump allocator with failure injection,
//! and a txg manager that drives registered sync/clean hooks.
//!
//! Intended for tests; a `crash` discards everything that never made it
//! through a cache flush, so crash/replay scenarios can run in-process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::chain::{BlockPointer, ZilHeader};
use crate::error::EngineError;

use super::{BlockEngine, IoPriority};

const ALLOC_ALIGN: u64 = 4096;

type TxgHook = Arc<dyn Fn(u64) + Send + Sync>;

/// In-memory pool. Clones share state.
#[derive(Clone, Default)]
pub struct Memory(Arc<Inner>);

#[derive(Default)]
struct Inner {
    state: Mutex<Pool>,
    cv: Condvar,
}

#[derive(Default)]
struct Pool {
    objset: u64,
    vdevs: Vec<Vdev>,
    claimed: BTreeSet<(u32, u64)>,
    clone_refs: BTreeSet<(u32, u64)>,
    header: ZilHeader,
    live_objects: Option<BTreeSet<u64>>,

    open_txg: u64,
    last_synced: u64,
    syncing: bool,
    holds: BTreeMap<u64, usize>,
    sync_hook: Option<TxgHook>,
    clean_hook: Option<TxgHook>,

    fail_allocs: u64,
    fail_flushes: u64,
    fail_writes: u64,

    writable: bool,
    frozen: bool,
    log_clear: bool,
    checkpointed: bool,
    encrypted: bool,
    key_loaded: bool,
}

#[derive(Default)]
struct Vdev {
    is_log: bool,
    next_offset: u64,
    blocks: BTreeMap<u64, Block>,
    flushes: u64,
}

struct Block {
    data: Vec<u8>,
    durable: bool,
    prio: IoPriority,
}

impl Memory {
    /// A pool with `nmain` main vdevs and `nlog` dedicated log vdevs, open
    /// at txg 1.
    pub fn new(objset: u64, nmain: usize, nlog: usize) -> Memory {
        assert!(nmain > 0);
        let mut vdevs = Vec::with_capacity(nmain + nlog);
        for _ in 0..nmain {
            vdevs.push(Vdev::default());
        }
        for _ in 0..nlog {
            vdevs.push(Vdev {
                is_log: true,
                ..Vdev::default()
            });
        }
        Memory(Arc::new(Inner {
            state: Mutex::new(Pool {
                objset,
                vdevs,
                open_txg: 1,
                writable: true,
                key_loaded: true,
                ..Pool::default()
            }),
            cv: Condvar::new(),
        }))
    }

    /// Register the hooks the txg manager runs for every syncing txg: the
    /// zilog's `sync` while the txg syncs, its `clean` once it has synced.
    pub fn set_txg_hooks(
        &self,
        sync: impl Fn(u64) + Send + Sync + 'static,
        clean: impl Fn(u64) + Send + Sync + 'static,
    ) {
        let mut st = self.0.state.lock();
        st.sync_hook = Some(Arc::new(sync));
        st.clean_hook = Some(Arc::new(clean));
    }

    /// Drop every write that never survived a cache flush, as a power loss
    /// would. Txg hooks are unregistered; counters keep advancing so a
    /// "reimport" continues the txg history.
    pub fn crash(&self) {
        let mut st = self.0.state.lock();
        st.sync_hook = None;
        st.clean_hook = None;
        st.holds.clear();
        st.syncing = false;
        for vdev in &mut st.vdevs {
            vdev.blocks.retain(|_, b| b.durable);
        }
        debug!("pool crashed; volatile caches dropped");
    }

    /// Fail the next `n` log-block allocations.
    pub fn inject_alloc_failures(&self, n: u64) {
        self.0.state.lock().fail_allocs = n;
    }

    /// Fail the next `n` vdev cache flushes.
    pub fn inject_flush_failures(&self, n: u64) {
        self.0.state.lock().fail_flushes = n;
    }

    /// Fail the next `n` block writes.
    pub fn inject_write_failures(&self, n: u64) {
        self.0.state.lock().fail_writes = n;
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.0.state.lock().frozen = frozen;
    }

    pub fn set_writable(&self, writable: bool) {
        self.0.state.lock().writable = writable;
    }

    pub fn set_log_clear(&self, v: bool) {
        self.0.state.lock().log_clear = v;
    }

    pub fn set_checkpointed(&self, v: bool) {
        self.0.state.lock().checkpointed = v;
    }

    pub fn set_encrypted(&self, encrypted: bool, key_loaded: bool) {
        let mut st = self.0.state.lock();
        st.encrypted = encrypted;
        st.key_loaded = key_loaded;
    }

    /// Restrict `object_exists` to an explicit live set. Without a call,
    /// every object exists.
    pub fn set_live_objects(&self, oids: impl IntoIterator<Item = u64>) {
        self.0.state.lock().live_objects = Some(oids.into_iter().collect());
    }

    /// Allocate and durably write a data block in the main pool, as the DMU
    /// would for an indirect write payload.
    pub fn put_data_block(&self, txg: u64, data: &[u8]) -> BlockPointer {
        let mut st = self.0.state.lock();
        let bp = st.alloc(0, data.len() as u64, txg);
        st.vdevs[0].blocks.insert(
            bp.offset,
            Block {
                data: data.to_vec(),
                durable: true,
                prio: IoPriority::AsyncWrite,
            },
        );
        bp
    }

    pub fn current_open_txg(&self) -> u64 {
        self.0.state.lock().open_txg
    }

    /// Number of blocks currently stored on `vdev`.
    pub fn block_count(&self, vdev: u32) -> usize {
        self.0.state.lock().vdevs[vdev as usize].blocks.len()
    }

    /// Number of cache flushes `vdev` has seen.
    pub fn flush_count(&self, vdev: u32) -> u64 {
        self.0.state.lock().vdevs[vdev as usize].flushes
    }

    /// The priority the block at `bp` was written with.
    pub fn write_priority(&self, bp: &BlockPointer) -> Option<IoPriority> {
        self.0.state.lock().vdevs[bp.vdev as usize]
            .blocks
            .get(&bp.offset)
            .map(|b| b.prio)
    }

    pub fn is_claimed(&self, bp: &BlockPointer) -> bool {
        self.0
            .state
            .lock()
            .claimed
            .contains(&(bp.vdev, bp.offset))
    }

    pub fn clone_ref_count(&self) -> usize {
        self.0.state.lock().clone_refs.len()
    }

    /// Corrupt one byte of the stored block at `bp`; for chain-termination
    /// tests.
    pub fn corrupt_block(&self, bp: &BlockPointer, at: usize) {
        let mut st = self.0.state.lock();
        if let Some(b) = st.vdevs[bp.vdev as usize].blocks.get_mut(&bp.offset) {
            b.data[at] ^= 0xff;
        }
    }
}

impl Pool {
    fn alloc(&mut self, vdev: usize, size: u64, txg: u64) -> BlockPointer {
        let v = &mut self.vdevs[vdev];
        let offset = v.next_offset;
        v.next_offset += size.max(ALLOC_ALIGN).next_multiple_of(ALLOC_ALIGN);
        BlockPointer {
            vdev: vdev as u32,
            size: size as u32,
            offset,
            birth_txg: txg,
            slim: false,
            cksum: Default::default(),
        }
    }
}

impl BlockEngine for Memory {
    fn objset(&self) -> u64 {
        self.0.state.lock().objset
    }

    fn writable(&self) -> bool {
        self.0.state.lock().writable
    }

    fn frozen(&self) -> bool {
        self.0.state.lock().frozen
    }

    fn log_clear_requested(&self) -> bool {
        self.0.state.lock().log_clear
    }

    fn checkpointed(&self) -> bool {
        self.0.state.lock().checkpointed
    }

    fn encrypted(&self) -> bool {
        self.0.state.lock().encrypted
    }

    fn key_available(&self) -> bool {
        self.0.state.lock().key_loaded
    }

    fn object_exists(&self, oid: u64) -> bool {
        let st = self.0.state.lock();
        st.live_objects
            .as_ref()
            .map_or(true, |live| live.contains(&oid))
    }

    fn load_header(&self) -> ZilHeader {
        self.0.state.lock().header
    }

    fn store_header(&self, hdr: &ZilHeader, txg: u64) {
        trace!("store header txg={txg}: {hdr:?}");
        self.0.state.lock().header = *hdr;
    }

    fn alloc_log_block(
        &self,
        txg: u64,
        size: u64,
        _prev: Option<&BlockPointer>,
        use_slog: bool,
    ) -> Result<BlockPointer, EngineError> {
        let mut st = self.0.state.lock();
        if st.fail_allocs > 0 {
            st.fail_allocs -= 1;
            return Err(EngineError::NoSpace);
        }
        let vdev = if use_slog {
            st.vdevs
                .iter()
                .position(|v| v.is_log)
                .unwrap_or(0)
        } else {
            0
        };
        Ok(st.alloc(vdev, size, txg))
    }

    fn claim_block(&self, _txg: u64, bp: &BlockPointer) -> Result<(), EngineError> {
        let mut st = self.0.state.lock();
        st.claimed.insert((bp.vdev, bp.offset));
        Ok(())
    }

    fn clone_ref_add(&self, _txg: u64, bp: &BlockPointer) -> Result<(), EngineError> {
        let mut st = self.0.state.lock();
        st.clone_refs.insert((bp.vdev, bp.offset));
        Ok(())
    }

    fn free_block(&self, _txg: u64, bp: &BlockPointer) {
        let mut st = self.0.state.lock();
        st.claimed.remove(&(bp.vdev, bp.offset));
        // The pointer may come out of a torn trailer; tolerate garbage.
        if let Some(v) = st.vdevs.get_mut(bp.vdev as usize) {
            v.blocks.remove(&bp.offset);
        }
    }

    fn read_block(&self, bp: &BlockPointer) -> Result<Vec<u8>, EngineError> {
        let st = self.0.state.lock();
        let found = st
            .vdevs
            .get(bp.vdev as usize)
            .and_then(|v| v.blocks.get(&bp.offset));
        match found {
            Some(b) if b.data.len() == bp.size as usize => Ok(b.data.clone()),
            // Unwritten, lost, or reused space reads back as zeroes.
            _ => Ok(vec![0; bp.size as usize]),
        }
    }

    fn write_block(
        &self,
        bp: &BlockPointer,
        data: &[u8],
        prio: IoPriority,
    ) -> Result<(), EngineError> {
        let mut st = self.0.state.lock();
        if st.fail_writes > 0 {
            st.fail_writes -= 1;
            return Err(EngineError::Io);
        }
        debug_assert!(data.len() <= bp.size as usize);
        let mut data = data.to_vec();
        data.resize(bp.size as usize, 0);
        st.vdevs[bp.vdev as usize].blocks.insert(
            bp.offset,
            Block {
                data,
                durable: false,
                prio,
            },
        );
        Ok(())
    }

    fn flush_vdev(&self, vdev: u32) -> Result<(), EngineError> {
        let mut st = self.0.state.lock();
        if st.fail_flushes > 0 {
            st.fail_flushes -= 1;
            return Err(EngineError::Io);
        }
        let v = &mut st.vdevs[vdev as usize];
        v.flushes += 1;
        for b in v.blocks.values_mut() {
            b.durable = true;
        }
        Ok(())
    }

    fn vdev_is_log(&self, vdev: u32) -> bool {
        self.0.state.lock().vdevs[vdev as usize].is_log
    }

    fn txg_hold(&self) -> u64 {
        let mut st = self.0.state.lock();
        let txg = st.open_txg;
        *st.holds.entry(txg).or_insert(0) += 1;
        txg
    }

    fn txg_rele(&self, txg: u64) {
        let mut st = self.0.state.lock();
        let n = st.holds.get_mut(&txg).expect("txg_rele without hold");
        *n -= 1;
        if *n == 0 {
            st.holds.remove(&txg);
            self.0.cv.notify_all();
        }
    }

    fn txg_wait_synced(&self, txg: u64) {
        let target = {
            let st = self.0.state.lock();
            if txg == 0 {
                st.open_txg
            } else {
                txg
            }
        };
        loop {
            let (t, hook) = {
                let mut st = self.0.state.lock();
                loop {
                    if st.last_synced >= target {
                        return;
                    }
                    if !st.syncing {
                        break;
                    }
                    self.0.cv.wait(&mut st);
                }
                st.syncing = true;
                let t = st.last_synced + 1;
                // Quiesce: open the next txg and wait out holders of t.
                if st.open_txg <= t {
                    st.open_txg = t + 1;
                }
                while st.holds.get(&t).copied().unwrap_or(0) > 0 {
                    self.0.cv.wait(&mut st);
                }
                (t, st.sync_hook.clone())
            };
            trace!("syncing txg {t}");
            if let Some(hook) = hook {
                hook(t);
            }
            let clean = {
                let mut st = self.0.state.lock();
                st.last_synced = t;
                st.syncing = false;
                self.0.cv.notify_all();
                st.clean_hook.clone()
            };
            if let Some(clean) = clean {
                clean(t);
            }
        }
    }

    fn last_synced_txg(&self) -> u64 {
        self.0.state.lock().last_synced
    }
}
