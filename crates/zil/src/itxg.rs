//! Per-txg itx groups: the staging area between producers and the writer
//! pipeline.
//!
//! Each zilog keeps a ring of `TXG_SIZE` slots keyed by `txg % TXG_SIZE`.
//! Producers append under the slot lock only, so the data plane never
//! contends with the issuer lock. A slot whose `txg` is zero is empty.

use std::collections::{BTreeMap, VecDeque};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::trace;

use crate::record::Itx;

/// Pending records of one txg: the sync list, ordered by assignment, and the
/// async tree of per-object lists.
#[derive(Debug, Default)]
pub(crate) struct ItxList {
    pub sync: VecDeque<Itx>,
    pub async_: BTreeMap<u64, VecDeque<Itx>>,
}

impl ItxList {
    /// Move async itxs for `oid` onto the sync list, preserving their
    /// per-object order. `oid == 0` promotes every object.
    pub fn promote(&mut self, oid: u64) {
        if oid == 0 {
            let trees = std::mem::take(&mut self.async_);
            for (_, mut list) in trees {
                self.sync.append(&mut list);
            }
        } else if let Some(mut list) = self.async_.remove(&oid) {
            self.sync.append(&mut list);
        }
    }

    /// Drop all pending async itxs for `oid`. Used when the object is
    /// unlinked: its id may be reused next txg.
    pub fn purge_async(&mut self, oid: u64) {
        if let Some(list) = self.async_.remove(&oid) {
            trace!("purged {} async itxs for unlinked oid {oid}", list.len());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sync.is_empty() && self.async_.is_empty()
    }
}

/// One ring slot. `txg == 0` means empty; a mismatching txg means the slot
/// still holds a previous occupant that must be cleaned aside.
#[derive(Debug, Default)]
pub(crate) struct ItxgSlot {
    pub txg: u64,
    pub itxs: Option<Box<ItxList>>,
}

impl ItxgSlot {
    /// Detach the current occupant if it belongs to a txg at or before
    /// `synced_txg`.
    pub fn detach_through(&mut self, synced_txg: u64) -> Option<Box<ItxList>> {
        if self.txg == 0 || self.txg > synced_txg {
            return None;
        }
        self.txg = 0;
        self.itxs.take()
    }
}

/// Off-thread destructor for detached itx groups.
///
/// Dropping an itx list runs every per-itx callback; `clean` must not do
/// that under the slot lock on the syncing thread, so lists are handed to a
/// worker. If the handoff fails the list is freed inline.
pub(crate) struct Cleaner {
    tx: Option<Sender<Box<ItxList>>>,
    worker: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn new() -> Cleaner {
        let (tx, rx) = bounded::<Box<ItxList>>(crate::TXG_SIZE);
        let worker = thread::Builder::new()
            .name("zil-clean".into())
            .spawn(move || {
                for list in rx {
                    drop(list);
                }
            })
            .ok();
        Cleaner {
            tx: worker.is_some().then_some(tx),
            worker,
        }
    }

    /// Free `list`, preferably on the worker thread.
    pub fn dispatch(&self, list: Box<ItxList>) {
        let Some(tx) = &self.tx else {
            return drop(list);
        };
        if let Err(TrySendError::Full(list) | TrySendError::Disconnected(list)) =
            tx.try_send(list)
        {
            drop(list);
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
