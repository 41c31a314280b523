//! Parent/child dependency graph for block-engine I/Os.
//!
//! The writer pipeline expresses its ordering discipline as edges: a parent
//! I/O cannot complete before all of its children have. Work (a storage
//! operation) runs once an I/O has been issued and all children are done;
//! completion callbacks then run on the completing thread, outside the graph
//! lock, and may themselves create, connect, and issue further I/Os. Errors
//! propagate from child to parent.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;

pub type ExecFn = Box<dyn FnOnce() -> Result<(), EngineError> + Send>;
pub type DoneFn = Box<dyn FnOnce(Option<EngineError>) + Send>;

/// Shared graph state; one per zilog. All node topology and state is guarded
/// by the single graph lock, which is never held across user callbacks or
/// storage operations.
#[derive(Clone, Default)]
pub struct IoRuntime {
    graph: Arc<Mutex<Graph>>,
}

#[derive(Default)]
struct Graph {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Default)]
struct Slot {
    gen: u64,
    node: Option<Node>,
    /// Error of the most recently completed occupant, kept for handles that
    /// query after completion.
    last: Option<(u64, Option<EngineError>)>,
}

struct Node {
    waiting: usize,
    issued: bool,
    done: bool,
    error: Option<EngineError>,
    parents: Vec<(usize, u64)>,
    exec: Option<ExecFn>,
    done_cb: Option<DoneFn>,
}

/// Handle to one I/O in the graph. Clones refer to the same node.
#[derive(Clone)]
pub struct Io {
    rt: IoRuntime,
    slot: usize,
    gen: u64,
}

impl IoRuntime {
    pub fn new() -> IoRuntime {
        IoRuntime::default()
    }

    fn insert(&self, node: Node) -> Io {
        let mut g = self.graph.lock();
        let slot = match g.free.pop() {
            Some(slot) => slot,
            None => {
                g.slots.push(Slot::default());
                g.slots.len() - 1
            }
        };
        let s = &mut g.slots[slot];
        s.gen += 1;
        s.node = Some(node);
        s.last = None;
        Io {
            rt: self.clone(),
            slot,
            gen: s.gen,
        }
    }

    /// A pure ordering node with a completion callback. Roots anchor the
    /// lwb completion chain.
    pub fn root(&self, done_cb: DoneFn) -> Io {
        self.insert(Node {
            waiting: 0,
            issued: false,
            done: false,
            error: None,
            parents: Vec::new(),
            exec: None,
            done_cb: Some(done_cb),
        })
    }

    /// An I/O that performs `exec` once issued and unblocked.
    pub fn op(&self, exec: ExecFn, done_cb: Option<DoneFn>) -> Io {
        self.insert(Node {
            waiting: 0,
            issued: false,
            done: false,
            error: None,
            parents: Vec::new(),
            exec: Some(exec),
            done_cb,
        })
    }
}

impl Io {
    /// Make `child` a dependency of `self`: `self` cannot complete until
    /// `child` has, and inherits its error. A child that already completed
    /// contributes only its error.
    pub fn add_child(&self, child: &Io) {
        debug_assert!(Arc::ptr_eq(&self.rt.graph, &child.rt.graph));
        let mut g = self.rt.graph.lock();
        let child_err = match g.node_mut(child) {
            Some(node) if !node.done => {
                node.parents.push((self.slot, self.gen));
                let parent = g
                    .node_mut(self)
                    .expect("parent i/o completed while children were being attached");
                parent.waiting += 1;
                return;
            }
            Some(node) => node.error,
            None => g.slots[child.slot]
                .last
                .filter(|(gen, _)| *gen == child.gen)
                .and_then(|(_, e)| e),
        };
        if let (Some(e), Some(parent)) = (child_err, g.node_mut(self)) {
            parent.error.get_or_insert(e);
        }
    }

    /// Record an error on a not-yet-completed I/O; its work is skipped and
    /// the error propagates as if the I/O had failed.
    pub fn fail(&self, error: EngineError) {
        let mut g = self.rt.graph.lock();
        if let Some(node) = g.node_mut(self) {
            debug_assert!(!node.done);
            node.error.get_or_insert(error);
        }
    }

    /// Issue the I/O. It completes once all children have; completion may
    /// happen inside this call, on the calling thread.
    pub fn nowait(self) {
        let ready = {
            let mut g = self.rt.graph.lock();
            match g.node_mut(&self) {
                Some(node) if !node.issued => {
                    node.issued = true;
                    node.waiting == 0
                }
                _ => false,
            }
        };
        if ready {
            kick(&self.rt, vec![(self.slot, self.gen)]);
        }
    }

    /// Create an operation in the same graph as a child of `self`. Used by
    /// data providers to hang indirect payload writes off an lwb's child
    /// slot; the caller issues the returned I/O.
    pub fn child_op(&self, exec: ExecFn) -> Io {
        let io = self.rt.op(exec, None);
        self.add_child(&io);
        io
    }

    pub fn is_done(&self) -> bool {
        let mut g = self.rt.graph.lock();
        match g.node_mut(self) {
            Some(node) => node.done,
            None => true,
        }
    }

    pub fn error(&self) -> Option<EngineError> {
        let mut g = self.rt.graph.lock();
        match g.node_mut(self) {
            Some(node) => node.error,
            None => g.slots[self.slot]
                .last
                .filter(|(gen, _)| *gen == self.gen)
                .and_then(|(_, e)| e),
        }
    }
}

impl Graph {
    fn node_mut(&mut self, io: &Io) -> Option<&mut Node> {
        let slot = self.slots.get_mut(io.slot)?;
        if slot.gen != io.gen {
            return None;
        }
        slot.node.as_mut()
    }
}

/// Drive completion of the given ready nodes and everything they unblock.
fn kick(rt: &IoRuntime, mut ready: Vec<(usize, u64)>) {
    while let Some((slot, gen)) = ready.pop() {
        // Run the storage operation, if any, outside the lock. A node that
        // already carries an error skips its work.
        let exec = {
            let mut g = rt.graph.lock();
            let node = g
                .node_mut(&Io {
                    rt: rt.clone(),
                    slot,
                    gen,
                })
                .expect("ready i/o vanished");
            debug_assert!(node.issued && node.waiting == 0 && !node.done);
            if node.error.is_some() {
                None
            } else {
                node.exec.take()
            }
        };
        let exec_err = exec.and_then(|f| f().err());

        // Mark done and run the completion callback before notifying
        // parents, so the callback may still attach children to them.
        let (error, done_cb) = {
            let mut g = rt.graph.lock();
            let node = g.slots[slot].node.as_mut().unwrap();
            if let Some(e) = exec_err {
                node.error.get_or_insert(e);
            }
            node.done = true;
            (node.error, node.done_cb.take())
        };
        if let Some(cb) = done_cb {
            cb(error);
        }

        {
            let mut g = rt.graph.lock();
            let node = g.slots[slot].node.take().unwrap();
            g.slots[slot].last = Some((gen, node.error));
            g.free.push(slot);
            for (pslot, pgen) in node.parents {
                let Some(parent) = g.node_mut(&Io {
                    rt: rt.clone(),
                    slot: pslot,
                    gen: pgen,
                }) else {
                    continue;
                };
                parent.waiting -= 1;
                if let Some(e) = node.error {
                    parent.error.get_or_insert(e);
                }
                if parent.issued && parent.waiting == 0 && !parent.done {
                    ready.push((pslot, pgen));
                }
            }
        }
    }
}
