//! # Waitable
//!
//! A counting signal with room for at most one parked waiter.
//!
//! `signal()` bumps a saturating counter and wakes the parked waiter, if any.
//! `wait()` consumes one count, or parks the caller until a signal arrives.
//! A task's completion is announced through a *latched* state: once latched,
//! every wait succeeds without consuming anything.
//!
//! ## Waiter capacity
//!
//! Only one waiter can be parked at a time. A second task that tries to wait
//! while the slot is held by someone else is refused ([`Occupied`]) and keeps
//! polling instead of replacing the first waiter, so neither of them can lose
//! a wakeup.

use core::cell::Cell;

use critical_section::{CriticalSection, Mutex};

use crate::task::TaskId;

/// The waiter slot is held by another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupied(pub TaskId);

/// Result of one attempt to wait, as seen by the waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    /// A count was consumed (or the state is latched); carry on.
    Acquired,
    /// The caller is recorded as the waiter and marked asleep; yield and retry.
    Parked,
    /// Another task holds the waiter slot; yield and retry.
    Busy,
}

/// The plain state behind a [`Waitable`]. Also embedded in every task slot
/// as its completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitState {
    count: u8,
    waiter: Option<TaskId>,
    latched: bool,
}

impl Default for WaitState {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitState {
    pub const fn new() -> Self {
        Self {
            count: 0,
            waiter: None,
            latched: false,
        }
    }

    #[inline]
    pub const fn count(&self) -> u8 {
        self.count
    }

    #[inline]
    pub const fn waiter(&self) -> Option<TaskId> {
        self.waiter
    }

    #[inline]
    pub const fn is_latched(&self) -> bool {
        self.latched
    }

    /// Adds one count and hands back the parked waiter, which the caller
    /// must wake.
    pub fn signal(&mut self) -> Option<TaskId> {
        self.count = self.count.saturating_add(1);
        self.waiter.take()
    }

    /// Makes the state permanently signaled and hands back the parked waiter.
    pub fn latch(&mut self) -> Option<TaskId> {
        self.latched = true;
        self.waiter.take()
    }

    /// Non-blocking consume.
    pub fn try_acquire(&mut self) -> bool {
        if self.latched {
            return true;
        }
        if self.count > 0 {
            self.count -= 1;
            return true;
        }
        false
    }

    /// Records `id` as the waiter. Re-registering the current waiter is fine.
    pub fn register(&mut self, id: TaskId) -> Result<(), Occupied> {
        match self.waiter {
            None => {
                self.waiter = Some(id);
                Ok(())
            }
            Some(w) if w == id => Ok(()),
            Some(other) => Err(Occupied(other)),
        }
    }
}

/// A [`WaitState`] that can be shared between tasks and interrupt handlers,
/// typically as a `static`.
///
/// ```ignore
/// static DATA_READY: Waitable = Waitable::new();
///
/// // in a task
/// costack::wait(&DATA_READY);
///
/// // in an interrupt handler or another task
/// costack::signal(&DATA_READY);
/// ```
pub struct Waitable {
    state: Mutex<Cell<WaitState>>,
}

impl Default for Waitable {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitable {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(WaitState::new())),
        }
    }

    /// Runs `f` on the state. The critical section token proves the caller
    /// holds the scheduler lock.
    pub(crate) fn with_state<R>(
        &self,
        cs: CriticalSection<'_>,
        f: impl FnOnce(&mut WaitState) -> R,
    ) -> R {
        let cell = self.state.borrow(cs);
        let mut state = cell.get();
        let r = f(&mut state);
        cell.set(state);
        r
    }

    /// Copy of the current state, for diagnostics.
    pub fn snapshot(&self) -> WaitState {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }
}
