//! Commit waiters: the blocking handle a `commit` caller sleeps on until the
//! lwb carrying its data reaches `FLUSH_DONE`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::EngineError;
use crate::lwb::Lwb;

/// Blocking handle linked to the lwb that will make its itx durable.
///
/// Created when a thread calls `commit`; freed when that call returns. The
/// waiter lock is the innermost lock of the hierarchy: it must never be held
/// while acquiring the issuer lock.
pub struct CommitWaiter {
    state: Mutex<WaiterState>,
    cv: Condvar,
}

#[derive(Default)]
struct WaiterState {
    done: bool,
    error: Option<EngineError>,
    lwb: Option<Arc<Lwb>>,
}

impl CommitWaiter {
    pub(crate) fn new() -> Arc<CommitWaiter> {
        Arc::new(CommitWaiter {
            state: Mutex::new(WaiterState::default()),
            cv: Condvar::new(),
        })
    }

    /// Link this waiter to the lwb that will carry its commit record.
    /// Relinking to a newer lwb is legal while the previous one has not been
    /// issued (the timeout path may move a waiter forward).
    pub(crate) fn link_lwb(&self, lwb: &Arc<Lwb>) {
        let mut st = self.state.lock();
        debug_assert!(!st.done);
        st.lwb = Some(Arc::clone(lwb));
    }

    /// Signal the waiter with the error its lwb's root I/O observed.
    pub(crate) fn done(&self, error: Option<EngineError>) {
        let mut st = self.state.lock();
        debug_assert!(!st.done);
        st.done = true;
        st.error = error;
        st.lwb = None;
        self.cv.notify_all();
    }

    /// Mark the waiter done without it ever having been attached to an lwb:
    /// nothing needed to be written on its behalf.
    pub(crate) fn skip(&self) {
        self.done(None);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub(crate) fn lwb(&self) -> Option<Arc<Lwb>> {
        self.state.lock().lwb.clone()
    }

    /// The error observed by the lwb this waiter was attached to, if any.
    pub fn error(&self) -> Option<EngineError> {
        self.state.lock().error
    }

    /// Block until done, without a timeout.
    pub(crate) fn wait(&self) {
        let mut st = self.state.lock();
        while !st.done {
            self.cv.wait(&mut st);
        }
    }

    /// Block until done or until `budget` elapses. Returns `true` if the
    /// waiter completed.
    pub(crate) fn wait_timed(&self, budget: Duration) -> bool {
        let mut st = self.state.lock();
        if st.done {
            return true;
        }
        self.cv.wait_for(&mut st, budget);
        st.done
    }
}
