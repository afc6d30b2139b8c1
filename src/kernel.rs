//! # Kernel
//!
//! The public API of costack and the global scheduler instance behind it.
//!
//! The API is written once, as the provided methods of [`Executor`]: a
//! scheduler reachable under the lock, plus a way to suspend the caller.
//! On the target the only executor is the global one, and the free
//! functions at the bottom of this module (`start`, `wait`, `join` and the
//! rest) forward to it.
//!
//! Every call takes the scheduler lock for as long as it touches shared
//! state and releases it before switching. Only `wake` and `signal` may be
//! called from interrupt handlers; everything that can suspend the caller
//! asserts Thread mode.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()   ← configure SysTick
//!         └─► kernel::start()  ← first task; returns once every task is done
//!               ├─► mainline parked at the head of the run queue
//!               ├─► scheduler stack painted (and guarded)
//!               └─► switch()   ← first task runs
//! ```

use core::time::Duration;

use critical_section::CriticalSection;

use crate::scheduler::{Platform, Scheduler};
use crate::task::{Stack, TaskFn, TaskHandle, TaskId};
use crate::time::Instant;
use crate::waitable::{WaitState, WaitStep, Waitable};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A scheduler together with the context switch that serves it.
pub trait Executor {
    type Platform: Platform;

    /// Runs `f` with the scheduler lock held.
    fn lock<R>(
        &self,
        f: impl FnOnce(&mut Scheduler<Self::Platform>, CriticalSection<'_>) -> R,
    ) -> R;

    /// Suspends the caller until the scheduler picks it again. Called with
    /// the lock released.
    fn switch(&self);

    /// Address a fresh task frame returns to.
    fn trampoline(&self) -> usize;

    /// Panics if the caller cannot be suspended.
    fn assert_thread_mode(&self) {}

    /// Runs `entry(param)` as a new task on `stack`.
    ///
    /// From mainline code this returns only once every task has finished.
    /// From a task it queues the new task behind the running ones and
    /// yields.
    ///
    /// If `stack` already holds a live task, this is just a yield.
    ///
    /// # Panics
    /// If every task slot holds a live task, or when called from an
    /// interrupt handler.
    fn start<const WORDS: usize>(&self, entry: TaskFn, param: u32, stack: &'static Stack<WORDS>) {
        self.assert_thread_mode();
        let trampoline = self.trampoline();

        self.lock(|sched, _| {
            let bounds = stack.bounds();
            if sched.is_live_stack(bounds) {
                return;
            }
            if sched.current().is_none() {
                sched.platform_mut().prepare_switch_stack();
            }
            // Safety: no live task runs on `stack`, checked above under the
            // lock.
            let sp = unsafe { stack.prepare(entry, param, trampoline) };
            if let Err(e) = sched.spawn(bounds, sp) {
                panic!("cannot start task: {}", e);
            }
        });

        self.switch();
    }

    /// Lets every other ready task run once before the caller continues.
    ///
    /// From mainline code with nothing scheduled, returns immediately.
    fn yield_now(&self) {
        self.assert_thread_mode();
        let idle = self.lock(|sched, _| sched.current().is_none());
        if !idle {
            self.switch();
        }
    }

    /// Ends the calling task with exit code `code`. Returning from the entry
    /// function does the same.
    fn exit(&self, code: u32) -> ! {
        self.assert_thread_mode();
        self.lock(|sched, _| sched.exit_current(code));
        self.switch();
        unreachable!("exited task was resumed");
    }

    /// Suspends the calling task until `deadline` or an explicit wake,
    /// whichever comes first. A deadline in the past still yields once.
    fn wait_until(&self, deadline: Instant) {
        self.assert_thread_mode();
        self.lock(|sched, _| sched.sleep_current(deadline));
        self.switch();
    }

    fn wait_forever(&self) {
        self.wait_until(Instant::END_OF_TIME);
    }

    /// Suspends the calling task for at least `d`.
    fn sleep(&self, d: Duration) {
        let deadline = self.now().saturating_add(d);
        self.wait_until(deadline);
    }

    /// Makes a sleeping task runnable. Never switches; safe from interrupts.
    ///
    /// A wake that reaches a task before it goes to sleep is remembered and
    /// cancels its next sleep.
    fn wake(&self, task: TaskId) {
        self.lock(|sched, _| sched.wake(task));
    }

    /// Signals `w`, waking its waiter. Never switches; safe from interrupts.
    fn signal(&self, w: &Waitable) {
        self.lock(|sched, cs| w.with_state(cs, |state| sched.signal(state)));
    }

    /// Consumes one signal from `w`, suspending until one arrives.
    fn wait(&self, w: &Waitable) {
        self.assert_thread_mode();
        loop {
            let step = self.lock(|sched, cs| w.with_state(cs, |state| sched.begin_wait(state)));
            match step {
                WaitStep::Acquired => return,
                WaitStep::Parked | WaitStep::Busy => self.switch(),
            }
        }
    }

    /// Yields once, then consumes a signal from `w` if one is pending.
    fn check(&self, w: &Waitable) -> bool {
        self.yield_now();
        self.lock(|_, cs| w.with_state(cs, WaitState::try_acquire))
    }

    /// Waits for the task last started on `stack` to finish and returns its
    /// exit code. Returns at once if it already has.
    ///
    /// # Panics
    /// If nothing was ever started on `stack`.
    fn join<const WORDS: usize>(&self, stack: &'static Stack<WORDS>) -> u32 {
        self.assert_thread_mode();
        let bounds = stack.bounds();
        loop {
            let attempt = self.lock(|sched, _| {
                let target = sched.find(bounds)?;
                let step = sched.begin_join(target);
                Some((step, sched.task(target).exit_code))
            });
            let Some((step, code)) = attempt else {
                panic!("join of a stack that never ran a task");
            };
            match step {
                WaitStep::Acquired => return code,
                WaitStep::Parked | WaitStep::Busy => self.switch(),
            }
        }
    }

    /// Yields once, then returns the exit code of the task last started on
    /// `stack` if it has finished by now.
    ///
    /// # Panics
    /// If nothing was ever started on `stack`.
    fn try_join<const WORDS: usize>(&self, stack: &'static Stack<WORDS>) -> Option<u32> {
        self.yield_now();
        let bounds = stack.bounds();
        let outcome = self.lock(|sched, _| {
            let target = sched.find(bounds)?;
            Some(sched.try_join(target))
        });
        let Some(code) = outcome else {
            panic!("join of a stack that never ran a task");
        };
        code
    }

    /// Snapshot of the task last started on `stack`. `None` if there never
    /// was one, or if its slot has since been reused for another stack.
    fn task_of<const WORDS: usize>(&self, stack: &'static Stack<WORDS>) -> Option<TaskHandle> {
        self.lock(|sched, _| sched.handle_of(stack.bounds()))
    }

    /// The running task (from an interrupt handler: the one it interrupted),
    /// or `None` from mainline code.
    fn current(&self) -> Option<TaskId> {
        self.lock(|sched, _| sched.current())
    }

    fn now(&self) -> Instant {
        self.lock(|sched, _| sched.now())
    }
}

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use self::global::*;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub(crate) mod global {
    use core::cell::RefCell;
    use core::time::Duration;

    use critical_section::{CriticalSection, Mutex};

    use super::Executor;
    use crate::arch::cortex_m::{self as arch, Board};
    use crate::scheduler::Scheduler;
    use crate::sync;
    use crate::task::{Stack, TaskFn, TaskHandle, TaskId};
    use crate::time::Instant;
    use crate::waitable::Waitable;

    /// Global scheduler instance, one per core.
    ///
    /// Built at compile time, so it is usable from the first instruction of
    /// `main()` and from any interrupt handler; only ever borrowed inside a
    /// critical section.
    pub(crate) static SCHEDULER: Mutex<RefCell<Scheduler<Board>>> =
        Mutex::new(RefCell::new(Scheduler::new(Board::new())));

    /// The global scheduler and the real context switch.
    pub struct Kernel;

    impl Executor for Kernel {
        type Platform = Board;

        fn lock<R>(&self, f: impl FnOnce(&mut Scheduler<Board>, CriticalSection<'_>) -> R) -> R {
            sync::critical_section(|cs| f(&mut *SCHEDULER.borrow_ref_mut(cs), cs))
        }

        fn switch(&self) {
            // Safety: every caller asserted Thread mode, and the lock has
            // been released.
            unsafe { arch::switch() }
        }

        fn trampoline(&self) -> usize {
            arch::trampoline_addr()
        }

        fn assert_thread_mode(&self) {
            arch::assert_thread_mode();
        }
    }

    /// Starts the clock. Without it deadlines never pass; everything else
    /// works.
    pub fn init(syst: &mut cortex_m::peripheral::SYST) {
        arch::configure_systick(syst);
        log::info!("costack up, {} task slots", crate::config::MAX_TASKS - 1);
    }

    /// Runs `entry(param)` as a new task on `stack`. See
    /// [`Executor::start`].
    ///
    /// # Example
    /// ```ignore
    /// static BLINK_STACK: Stack<256> = Stack::new();
    ///
    /// fn blink(period_ms: u32) -> u32 {
    ///     loop {
    ///         toggle_led();
    ///         costack::sleep(Duration::from_millis(period_ms as u64));
    ///     }
    /// }
    ///
    /// costack::start(blink, 500, &BLINK_STACK);
    /// ```
    pub fn start<const WORDS: usize>(entry: TaskFn, param: u32, stack: &'static Stack<WORDS>) {
        Kernel.start(entry, param, stack)
    }

    pub fn yield_now() {
        Kernel.yield_now()
    }

    pub fn exit(code: u32) -> ! {
        Kernel.exit(code)
    }

    pub fn wait_until(deadline: Instant) {
        Kernel.wait_until(deadline)
    }

    /// Suspends the calling task until someone calls [`wake`] on it.
    pub fn wait_forever() {
        Kernel.wait_forever()
    }

    pub fn sleep(d: Duration) {
        Kernel.sleep(d)
    }

    /// Makes a sleeping task runnable. Never switches; safe from interrupts.
    pub fn wake(task: TaskId) {
        Kernel.wake(task)
    }

    /// Signals `w`, waking its waiter. Never switches; safe from interrupts.
    pub fn signal(w: &Waitable) {
        Kernel.signal(w)
    }

    pub fn wait(w: &Waitable) {
        Kernel.wait(w)
    }

    pub fn check(w: &Waitable) -> bool {
        Kernel.check(w)
    }

    /// Waits for the task last started on `stack` and returns its exit code.
    pub fn join<const WORDS: usize>(stack: &'static Stack<WORDS>) -> u32 {
        Kernel.join(stack)
    }

    pub fn try_join<const WORDS: usize>(stack: &'static Stack<WORDS>) -> Option<u32> {
        Kernel.try_join(stack)
    }

    pub fn task_of<const WORDS: usize>(stack: &'static Stack<WORDS>) -> Option<TaskHandle> {
        Kernel.task_of(stack)
    }

    pub fn current() -> Option<TaskId> {
        Kernel.current()
    }

    pub fn now() -> Instant {
        Kernel.now()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
