//! # Scheduler
//!
//! Core scheduling logic for costack: the task arena, the run queue, the timer
//! queue and the single hardware alarm. Everything here is plain safe code
//! operating on [`TaskId`]s; the context-switch primitive hands it saved stack
//! pointers and gets stack pointers back.
//!
//! ## Queues
//!
//! - The **run queue** is FIFO. Its head is the task that is executing right
//!   now; the rest are ready, in the order they were last queued.
//! - The **timer queue** holds sleeping tasks sorted by deadline. Tasks
//!   sleeping without a deadline sit at its tail.
//!
//! Every live task is in exactly one of them. The mainline (the non-task
//! caller that started the first task) sits at the head of the run queue only
//! while it bootstraps the first task; after that it is parked in no queue at
//! all until every task has drained.
//!
//! ## Switch Algorithm
//!
//! On every yield, with the lock held, [`Scheduler::switch_out`]:
//! 1. pops the previous task from the head of the run queue and saves its
//!    stack pointer,
//! 2. checks that the pointer still lies inside its stack (debug builds),
//! 3. retires it (exit), parks it (sleep) or re-queues it at the tail,
//! 4. re-arms the alarm for the soonest deadline, waking anything whose
//!    deadline has already passed,
//! 5. picks the new head of the run queue, or reports [`Switch::Idle`] when
//!    only sleepers remain, or returns to the mainline when nothing does.

use core::fmt;

use crate::config::MAX_TASKS;
use crate::list::TaskList;
use crate::task::{
    StackBounds, TaskControlBlock, TaskHandle, TaskId, TaskState, INVALID_SP,
};
use crate::time::Instant;
use crate::waitable::{WaitState, WaitStep};

// ---------------------------------------------------------------------------
// Platform seam
// ---------------------------------------------------------------------------

/// What the scheduler needs from the hardware: a clock, one alarm, and
/// optionally memory protection for stack guards.
///
/// The alarm is expected to call [`Scheduler::on_alarm`] (with the lock held)
/// when it fires.
pub trait Platform {
    fn now(&self) -> Instant;

    /// Arms the alarm for `at`, replacing any alarm armed earlier. Returns
    /// `false`, leaving no alarm armed, if `at` has already passed.
    fn arm_alarm(&mut self, at: Instant) -> bool;

    fn cancel_alarm(&mut self);

    /// Makes the bottom of `stack` inaccessible. Returns the region used, or
    /// `None` if guards are unsupported or all regions are taken.
    fn install_guard(&mut self, _stack: StackBounds) -> Option<u8> {
        None
    }

    fn remove_guard(&mut self, _region: u8) {}

    /// Readies whatever stack the scheduling decision runs on. Called before
    /// the first task is admitted from mainline context.
    fn prepare_switch_stack(&mut self) {}
}

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// Resume the context saved at this stack pointer.
    Resume(usize),
    /// Nothing is ready but tasks are sleeping. Release the lock, wait for an
    /// event, then call [`Scheduler::poll_idle`].
    Idle,
}

/// Why a task could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// Every arena slot holds a live task.
    ArenaFull,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::ArenaFull => write!(f, "all {} task slots are live", MAX_TASKS - 1),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state. One instance per core, stored as a global
/// in `kernel.rs` and only touched with the lock held.
pub struct Scheduler<P> {
    /// Fixed-size task arena. Slot 0 is the mainline.
    pub(crate) tasks: [TaskControlBlock; MAX_TASKS],

    /// Ready-to-run FIFO; the head is running.
    pub(crate) ready: TaskList,

    /// Sleepers, soonest deadline first.
    pub(crate) timers: TaskList,

    platform: P,

    /// Deadline the alarm is currently armed for.
    armed: Option<Instant>,

    /// Start counter, used to reuse the oldest exited slot first.
    generation: u32,

    #[cfg(feature = "track-execution-time")]
    resumed_at: Instant,
}

impl<P: Platform> Scheduler<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            tasks: [TaskControlBlock::VACANT; MAX_TASKS],
            ready: TaskList::new(),
            timers: TaskList::new(),
            platform,
            armed: None,
            generation: 0,
            #[cfg(feature = "track-execution-time")]
            resumed_at: Instant::ZERO,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn now(&self) -> Instant {
        self.platform.now()
    }

    /// Deadline the alarm is armed for, if any.
    pub fn armed(&self) -> Option<Instant> {
        self.armed
    }

    /// The task currently executing, or `None` in mainline context.
    pub fn current(&self) -> Option<TaskId> {
        self.ready.peek_front().filter(|id| !id.is_mainline())
    }

    pub fn task(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id.index()]
    }

    /// Id of the run currently in `slot`.
    fn id_at(&self, slot: usize) -> TaskId {
        TaskId::with_generation(slot, self.tasks[slot].generation)
    }

    /// Slot that was last started on `stack`.
    pub fn find(&self, stack: StackBounds) -> Option<TaskId> {
        self.tasks
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, t)| t.state != TaskState::Vacant && t.stack == stack)
            .map(|(i, _)| self.id_at(i))
    }

    /// Whether `stack` holds a task that has been started and not exited.
    pub fn is_live_stack(&self, stack: StackBounds) -> bool {
        self.find(stack)
            .is_some_and(|id| self.tasks[id.index()].is_live())
    }

    /// Snapshot of the task last started on `stack`; `None` if never started,
    /// or if its slot has since been taken over by another stack.
    pub fn handle_of(&self, stack: StackBounds) -> Option<TaskHandle> {
        self.find(stack)
            .map(|id| self.tasks[id.index()].handle(id))
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Admits a task whose stack has been prepared with an initial frame at
    /// `sp`, and queues it at the tail of the run queue. The caller must yield
    /// afterwards.
    ///
    /// Called from mainline context, this also puts the mainline at the head
    /// of the run queue so that the next switch has somewhere to save it.
    pub fn spawn(&mut self, stack: StackBounds, sp: usize) -> Result<TaskId, StartError> {
        assert!(!self.is_live_stack(stack), "stack already holds a live task");
        let slot = self.allocate(stack)?;

        if self.ready.is_empty() {
            let mainline = &mut self.tasks[TaskId::MAINLINE.index()];
            mainline.state = TaskState::Running;
            self.ready.push_front(&mut self.tasks[..], TaskId::MAINLINE);
        }

        self.generation = self.generation.wrapping_add(1);
        let id = TaskId::with_generation(slot, self.generation);
        let tcb = &mut self.tasks[slot];
        tcb.init(stack, sp, self.generation);
        tcb.guard = self.platform.install_guard(stack);
        self.ready.push_back(&mut self.tasks[..], id);

        log::debug!(
            "task {} started, stack {:#x}..{:#x}",
            id,
            stack.bottom,
            stack.top
        );
        Ok(id)
    }

    /// Picks a slot for `stack`: the one it used before, else a vacant one,
    /// else the exited slot that was started longest ago.
    fn allocate(&self, stack: StackBounds) -> Result<usize, StartError> {
        if let Some(id) = self.find(stack) {
            return Ok(id.index());
        }

        let slots = self.tasks.iter().enumerate().skip(1);
        if let Some((i, _)) = slots
            .clone()
            .find(|(_, t)| t.state == TaskState::Vacant)
        {
            return Ok(i);
        }

        slots
            .filter(|(_, t)| t.state == TaskState::Exited && !t.link.is_linked())
            .min_by_key(|(_, t)| t.generation)
            .map(|(i, _)| i)
            .ok_or(StartError::ArenaFull)
    }

    /// Marks the running task as exiting. The next switch retires it.
    pub fn exit_current(&mut self, code: u32) {
        let id = self.current().expect("exit() outside a task");
        let tcb = &mut self.tasks[id.index()];
        tcb.exiting = true;
        tcb.exit_code = code;
    }

    /// Marks the running task asleep until `deadline` (or until woken, for
    /// [`Instant::END_OF_TIME`]). The next switch parks it.
    pub fn sleep_current(&mut self, deadline: Instant) {
        let id = self.current().expect("wait_until() outside a task");
        let tcb = &mut self.tasks[id.index()];
        tcb.sleep_count = tcb
            .sleep_count
            .checked_add(1)
            .expect("sleep counter overflow");
        tcb.wake_at = deadline;
    }

    /// Wakes a sleeping task: it leaves the timer queue for the tail of the
    /// run queue. Safe from interrupt context; never switches.
    ///
    /// A wake that arrives before the task has been parked (the task is still
    /// running, or already queued) only cancels its pending sleep.
    ///
    /// # Panics
    /// If `id` is not live, or names an earlier run of a slot that has been
    /// started again since.
    pub fn wake(&mut self, id: TaskId) {
        let deadline = self.tasks[id.index()].wake_at;
        if self.wake_inner(id) && self.armed == Some(deadline) {
            // the alarm was set for this task; move it on to the next one
            self.platform.cancel_alarm();
            self.armed = None;
            self.prime_alarm();
        }
    }

    /// Returns whether `id` was the head of the timer queue.
    fn wake_inner(&mut self, id: TaskId) -> bool {
        let tcb = &mut self.tasks[id.index()];
        assert_eq!(
            id.generation(),
            tcb.generation,
            "wake of task {} from an earlier run of its slot",
            id
        );
        assert!(
            !id.is_mainline() && tcb.is_live(),
            "wake of task {} which is not live",
            id
        );
        tcb.sleep_count = tcb
            .sleep_count
            .checked_sub(1)
            .expect("wake counter underflow");
        tcb.wake_at = Instant::END_OF_TIME;
        log::trace!("wake {} (sleep count {})", id, tcb.sleep_count);

        let state = tcb.state;
        match state {
            TaskState::Sleeping => {
                let was_head = self.timers.peek_front() == Some(id);
                self.timers.remove(&mut self.tasks[..], id);
                self.tasks[id.index()].state = TaskState::Ready;
                self.ready.push_back(&mut self.tasks[..], id);
                was_head
            }
            TaskState::Running | TaskState::Ready => false,
            state => panic!("wake of task {} in state {:?}", id, state),
        }
    }

    /// Alarm handler: wakes every sleeper whose deadline has passed and
    /// re-arms for the next one. Spurious calls are harmless.
    pub fn on_alarm(&mut self) {
        self.armed = None;
        let now = self.platform.now();
        while let Some(head) = self.timers.peek_front() {
            let at = self.tasks[head.index()].wake_at;
            if at.is_end_of_time() || at > now {
                break;
            }
            self.wake_inner(head);
        }
        self.prime_alarm();
    }

    /// Arms the alarm for the head of the timer queue unless it is already
    /// armed for that deadline or sooner. Deadlines that have already passed
    /// are woken on the spot.
    fn prime_alarm(&mut self) {
        while let Some(head) = self.timers.peek_front() {
            let at = self.tasks[head.index()].wake_at;
            if at.is_end_of_time() || self.armed.is_some_and(|armed| armed <= at) {
                return;
            }
            if self.platform.arm_alarm(at) {
                log::trace!("alarm armed for {} at {}us", head, at.as_micros());
                self.armed = Some(at);
                return;
            }
            // Too late already. Back on the run queue, at the tail: the head
            // may be running and this is not a preemptive scheduler.
            self.armed = None;
            self.wake_inner(head);
        }
    }

    // -----------------------------------------------------------------------
    // Wait / signal
    // -----------------------------------------------------------------------

    /// Signals `w`, waking its parked waiter if there is one.
    pub fn signal(&mut self, w: &mut WaitState) {
        if let Some(waiter) = w.signal() {
            self.wake(waiter);
        }
    }

    /// One attempt of the running task to consume `w`. On
    /// [`WaitStep::Parked`] the task is asleep and must yield; on
    /// [`WaitStep::Busy`] it must yield and try again.
    pub fn begin_wait(&mut self, w: &mut WaitState) -> WaitStep {
        if w.try_acquire() {
            return WaitStep::Acquired;
        }
        let id = self.current().expect("wait() outside a task");
        match w.register(id) {
            Ok(()) => {
                self.sleep_current(Instant::END_OF_TIME);
                WaitStep::Parked
            }
            Err(_) => WaitStep::Busy,
        }
    }

    /// [`Scheduler::begin_wait`] on the completion signal of `target`.
    pub fn begin_join(&mut self, target: TaskId) -> WaitStep {
        assert!(
            self.current() != Some(target),
            "task {} cannot join itself",
            target
        );
        assert!(
            !target.is_mainline() && self.tasks[target.index()].state != TaskState::Vacant,
            "join of task {} which was never started",
            target
        );
        let mut done = self.tasks[target.index()].done;
        let step = self.begin_wait(&mut done);
        self.tasks[target.index()].done = done;
        step
    }

    /// Exit code of `target` if it has exited, without suspending. Any number
    /// of calls succeed once it has.
    pub fn try_join(&mut self, target: TaskId) -> Option<u32> {
        let tcb = &mut self.tasks[target.index()];
        assert!(
            !target.is_mainline() && tcb.state != TaskState::Vacant,
            "join of task {} which was never started",
            target
        );
        tcb.done.try_acquire().then_some(tcb.exit_code)
    }

    // -----------------------------------------------------------------------
    // Switching
    // -----------------------------------------------------------------------

    /// The scheduling decision, run by the context-switch primitive with the
    /// lock held. `sp` is the stack pointer the previous task was suspended
    /// at.
    pub fn switch_out(&mut self, sp: usize) -> Switch {
        let prev = self
            .ready
            .pop_front(&mut self.tasks[..])
            .expect("switch with an empty run queue");
        self.charge(prev);

        let tcb = &mut self.tasks[prev.index()];
        tcb.sp = sp;

        if prev.is_mainline() {
            // runs only once per bootstrap; resumed when everything drains
            tcb.state = TaskState::Parked;
        } else {
            if cfg!(debug_assertions) {
                assert!(
                    tcb.is_live(),
                    "task {} suspended with sp {:#x} outside its stack {:#x}..{:#x}",
                    prev,
                    sp,
                    tcb.stack.bottom,
                    tcb.stack.top
                );
            }

            if tcb.exiting {
                self.retire(prev);
            } else if tcb.is_sleeping() {
                self.park(prev);
            } else {
                tcb.state = TaskState::Ready;
                self.ready.push_back(&mut self.tasks[..], prev);
            }
        }

        self.prime_alarm();
        self.pick_next()
    }

    /// Re-checks after an idle wait. Anything may have happened meanwhile:
    /// an interrupt woke a task, the alarm fired, or nothing at all.
    pub fn poll_idle(&mut self) -> Switch {
        self.pick_next()
    }

    fn retire(&mut self, id: TaskId) {
        let tcb = &mut self.tasks[id.index()];
        debug_assert!(!tcb.is_sleeping(), "task {} exits while asleep", id);

        // a stale resume must fail fast, and a later liveness check must not
        // mistake leftovers for a live task
        tcb.sp = INVALID_SP;
        tcb.state = TaskState::Exited;
        let waiter = tcb.done.latch();
        if let Some(region) = tcb.guard.take() {
            self.platform.remove_guard(region);
        }
        log::debug!("task {} exited with code {}", id, tcb.exit_code);

        if let Some(waiter) = waiter {
            self.wake(waiter);
        }
    }

    fn park(&mut self, id: TaskId) {
        let tcb = &mut self.tasks[id.index()];
        tcb.state = TaskState::Sleeping;
        if tcb.wake_at.is_end_of_time() {
            self.timers.push_back(&mut self.tasks[..], id);
        } else {
            self.timers.sorted_insert(
                &mut self.tasks[..],
                id,
                |t: &[TaskControlBlock], i: TaskId| t[i.index()].wake_at,
            );
        }
    }

    fn pick_next(&mut self) -> Switch {
        let next = match self.ready.peek_front() {
            Some(next) => next,
            None if self.timers.is_empty() => {
                // nothing left at all: back to whoever started the first task
                let mainline = &mut self.tasks[TaskId::MAINLINE.index()];
                assert!(mainline.sp != 0, "nothing to run and no mainline to return to");
                mainline.state = TaskState::Running;
                log::debug!("all tasks drained, returning to mainline");
                return Switch::Resume(mainline.sp);
            }
            None => return Switch::Idle,
        };

        let tcb = &mut self.tasks[next.index()];
        if cfg!(debug_assertions) && !next.is_mainline() {
            assert!(
                tcb.is_live(),
                "task {} resumed with sp {:#x} outside its stack {:#x}..{:#x}",
                next,
                tcb.sp,
                tcb.stack.bottom,
                tcb.stack.top
            );
        }
        tcb.state = TaskState::Running;
        let sp = tcb.sp;
        self.mark_resumed();
        Switch::Resume(sp)
    }

    #[cfg(feature = "track-execution-time")]
    fn charge(&mut self, id: TaskId) {
        let now = self.platform.now();
        self.tasks[id.index()].time_executing += now.micros_since(self.resumed_at);
        self.resumed_at = now;
    }

    #[cfg(not(feature = "track-execution-time"))]
    fn charge(&mut self, _id: TaskId) {}

    #[cfg(feature = "track-execution-time")]
    fn mark_resumed(&mut self) {
        self.resumed_at = self.platform.now();
    }

    #[cfg(not(feature = "track-execution-time"))]
    fn mark_resumed(&mut self) {}

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Panics unless the queues agree with every task's state: each live task
    /// is in exactly one queue (or running at the head of the run queue), and
    /// the alarm is armed for the soonest deadline.
    pub fn assert_consistent(&self) {
        let tasks = &self.tasks[..];
        for (i, tcb) in self.tasks.iter().enumerate().skip(1) {
            let id = self.id_at(i);
            let in_ready = self.ready.contains(tasks, id);
            let in_timers = self.timers.contains(tasks, id);
            let is_head = self.ready.peek_front() == Some(id);
            let ok = match tcb.state {
                TaskState::Running => is_head && !in_timers,
                TaskState::Ready => in_ready && !is_head && !in_timers,
                TaskState::Sleeping => in_timers && !in_ready,
                TaskState::Vacant | TaskState::Exited | TaskState::Parked => {
                    !in_ready && !in_timers
                }
            };
            assert!(
                ok,
                "task {} is {:?} but in_ready={} in_timers={} head={}",
                id, tcb.state, in_ready, in_timers, is_head
            );
        }

        let mut last = Instant::ZERO;
        for id in self.timers.iter(tasks) {
            let at = self.tasks[id.index()].wake_at;
            assert!(at >= last, "timer queue out of order at {}", id);
            last = at;
        }

        if let Some(head) = self.timers.peek_front() {
            let at = self.tasks[head.index()].wake_at;
            if !at.is_end_of_time() {
                assert_eq!(self.armed, Some(at), "alarm not armed for the soonest deadline");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::guard::GuardSlots;
    use crate::task::FRAME_WORDS;

    // --- fake hardware -----------------------------------------------------

    #[derive(Default)]
    struct FakePlatform {
        now: u64,
        alarm: Option<Instant>,
        arms: Vec<u64>,
        cancels: usize,
        guards: GuardSlots,
        guard_log: Vec<(bool, u8)>,
    }

    impl Platform for FakePlatform {
        fn now(&self) -> Instant {
            Instant::from_millis(self.now)
        }

        fn arm_alarm(&mut self, at: Instant) -> bool {
            if at <= self.now() {
                self.alarm = None;
                return false;
            }
            self.alarm = Some(at);
            self.arms.push(at.as_micros() / 1000);
            true
        }

        fn cancel_alarm(&mut self) {
            self.alarm = None;
            self.cancels += 1;
        }

        fn install_guard(&mut self, _stack: StackBounds) -> Option<u8> {
            let region = self.guards.claim(|_| false)?;
            self.guard_log.push((true, region));
            Some(region)
        }

        fn remove_guard(&mut self, region: u8) {
            self.guards.release(region);
            self.guard_log.push((false, region));
        }
    }

    // --- task simulator ----------------------------------------------------
    //
    // Each simulated task runs a script of steps. Steps that would suspend a
    // real task end the script's turn and go through `switch_out`, exactly
    // like the kernel does, so the scheduler sees the same call sequence.

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Log(&'static str),
        Yield,
        Start(usize),
        Exit(u32),
        SleepFor(u64),
        SleepForever,
        Wake(usize),
        Wait(usize),
        Signal(usize),
        Check(usize),
        Join(usize),
    }

    struct Script {
        ops: Vec<Op>,
        pc: usize,
        ret: u32,
        checking: bool,
    }

    const MAINLINE_SP: usize = 0x1000_0000;

    struct Sim {
        sched: Scheduler<FakePlatform>,
        scripts: Vec<Script>,
        waitables: Vec<WaitState>,
        irqs: Vec<(u64, usize)>,
        log: Vec<(&'static str, u64)>,
        joined: Vec<u32>,
    }

    impl Sim {
        fn new(programs: Vec<(Vec<Op>, u32)>) -> Self {
            Sim {
                sched: Scheduler::new(FakePlatform::default()),
                scripts: programs
                    .into_iter()
                    .map(|(ops, ret)| Script {
                        ops,
                        pc: 0,
                        ret,
                        checking: false,
                    })
                    .collect(),
                waitables: std::vec![WaitState::new(); 4],
                irqs: Vec::new(),
                log: Vec::new(),
                joined: Vec::new(),
            }
        }

        fn bounds(i: usize) -> StackBounds {
            let bottom = 0x2000_0000 + i * 0x1000;
            StackBounds {
                bottom,
                top: bottom + 256 * 4,
            }
        }

        fn id(&self, i: usize) -> TaskId {
            self.sched.find(Self::bounds(i)).expect("script never started")
        }

        fn script_of(&self, id: TaskId) -> usize {
            let stack = self.sched.task(id).stack;
            (0..self.scripts.len())
                .find(|&i| Self::bounds(i) == stack)
                .expect("unknown task")
        }

        fn names(&self) -> Vec<&'static str> {
            self.log.iter().map(|(n, _)| *n).collect()
        }

        /// Same as `kernel::start` minus the real stack.
        fn spawn(&mut self, i: usize) -> TaskId {
            let b = Self::bounds(i);
            self.scripts[i].pc = 0;
            self.sched.spawn(b, b.top - FRAME_WORDS * 4).unwrap()
        }

        fn start(&mut self, i: usize) {
            if !self.sched.is_live_stack(Self::bounds(i)) {
                self.spawn(i);
            }
            self.switch();
        }

        /// Starts `tasks` from mainline context and runs until everything
        /// has drained back to the mainline.
        fn run_from_mainline(&mut self, tasks: &[usize]) {
            assert_eq!(self.sched.current(), None);
            for &i in tasks {
                self.spawn(i);
            }
            self.switch();
            while let Some(id) = self.sched.current() {
                self.sched.assert_consistent();
                let i = self.script_of(id);
                self.step(i);
            }
            self.sched.assert_consistent();
        }

        fn sp_of_running(&self) -> usize {
            match self.sched.ready.peek_front() {
                Some(id) if id.is_mainline() => MAINLINE_SP,
                Some(id) => self.sched.task(id).stack.top - FRAME_WORDS * 4,
                None => panic!("nobody is running"),
            }
        }

        fn switch(&mut self) {
            let sp = self.sp_of_running();
            let mut next = self.sched.switch_out(sp);
            while next == Switch::Idle {
                self.idle();
                next = self.sched.poll_idle();
            }
            if self.sched.current().is_none() {
                assert_eq!(next, Switch::Resume(MAINLINE_SP));
            }
        }

        /// Advances time to the next interrupt: a scripted wake or the alarm.
        fn idle(&mut self) {
            let alarm = self.sched.platform().alarm.map(|a| a.as_micros() / 1000);
            let irq = self.irqs.first().copied();
            match (irq, alarm) {
                (Some((t, i)), a) if a.map_or(true, |a| t < a) => {
                    self.irqs.remove(0);
                    self.sched.platform_mut().now = t;
                    let id = self.id(i);
                    self.sched.wake(id);
                }
                (_, Some(a)) => {
                    let p = self.sched.platform_mut();
                    p.now = a;
                    p.alarm = None;
                    self.sched.on_alarm();
                }
                _ => panic!("deadlock: idle with no alarm and no interrupt"),
            }
        }

        fn step(&mut self, i: usize) {
            loop {
                let script = &self.scripts[i];
                let op = script
                    .ops
                    .get(script.pc)
                    .copied()
                    .unwrap_or(Op::Exit(script.ret));
                match op {
                    Op::Log(name) => {
                        let now = self.sched.platform().now;
                        self.log.push((name, now));
                        self.scripts[i].pc += 1;
                    }
                    Op::Yield => {
                        self.scripts[i].pc += 1;
                        return self.switch();
                    }
                    Op::Start(j) => {
                        self.scripts[i].pc += 1;
                        return self.start(j);
                    }
                    Op::Exit(code) => {
                        self.sched.exit_current(code);
                        return self.switch();
                    }
                    Op::SleepFor(ms) => {
                        self.scripts[i].pc += 1;
                        let at = Instant::from_millis(self.sched.platform().now + ms);
                        self.sched.sleep_current(at);
                        return self.switch();
                    }
                    Op::SleepForever => {
                        self.scripts[i].pc += 1;
                        self.sched.sleep_current(Instant::END_OF_TIME);
                        return self.switch();
                    }
                    Op::Wake(j) => {
                        let id = self.id(j);
                        self.sched.wake(id);
                        self.scripts[i].pc += 1;
                    }
                    Op::Signal(w) => {
                        self.sched.signal(&mut self.waitables[w]);
                        self.scripts[i].pc += 1;
                    }
                    Op::Wait(w) => match self.sched.begin_wait(&mut self.waitables[w]) {
                        WaitStep::Acquired => self.scripts[i].pc += 1,
                        WaitStep::Parked | WaitStep::Busy => return self.switch(),
                    },
                    Op::Check(w) => {
                        if !self.scripts[i].checking {
                            self.scripts[i].checking = true;
                            return self.switch();
                        }
                        self.scripts[i].checking = false;
                        let ok = self.waitables[w].try_acquire();
                        let now = self.sched.platform().now;
                        self.log.push((if ok { "check+" } else { "check-" }, now));
                        self.scripts[i].pc += 1;
                    }
                    Op::Join(j) => {
                        let target = self.id(j);
                        match self.sched.begin_join(target) {
                            WaitStep::Acquired => {
                                self.joined.push(self.sched.task(target).exit_code);
                                self.scripts[i].pc += 1;
                            }
                            WaitStep::Parked | WaitStep::Busy => return self.switch(),
                        }
                    }
                }
            }
        }
    }

    fn yields(name: &'static str, n: usize) -> Vec<Op> {
        (0..n).flat_map(|_| [Op::Log(name), Op::Yield]).collect()
    }

    // --- scenarios -----------------------------------------------------------

    #[test]
    fn test_nested_start_interleaving() {
        let mut a = std::vec![Op::Start(1)];
        a.extend(yields("A", 5));
        let b = yields("B", 3);
        let mut sim = Sim::new(std::vec![(a, 0), (b, 0)]);

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.names(), ["B", "A", "B", "A", "B", "A", "A", "A"]);
        assert_eq!(sim.sched.current(), None);
        assert!(sim.sched.ready.is_empty());
        assert!(sim.sched.timers.is_empty());
    }

    #[test]
    fn test_fifo_fairness() {
        let names = ["t1", "t2", "t3", "t4"];
        let programs = names.iter().map(|&n| (yields(n, 3), 0)).collect();
        let mut sim = Sim::new(programs);

        sim.run_from_mainline(&[0, 1, 2, 3]);

        let expected: Vec<&str> = (0..3).flat_map(|_| names).collect();
        assert_eq!(sim.names(), expected);
    }

    #[test]
    fn test_timer_ordering_and_alarm_minimum() {
        let sleeper = |ms, name| (std::vec![Op::SleepFor(ms), Op::Log(name)], 0);
        let mut sim = Sim::new(std::vec![
            sleeper(30, "30"),
            sleeper(10, "10"),
            sleeper(20, "20"),
        ]);

        sim.run_from_mainline(&[0, 1, 2]);

        assert_eq!(sim.log, [("10", 10), ("20", 20), ("30", 30)]);
        assert_eq!(sim.sched.platform().arms, [30, 10, 20, 30]);
    }

    #[test]
    fn test_wake_before_deadline_rearms_for_next_sleeper() {
        let parent = std::vec![Op::Start(1), Op::Start(2)];
        let a = std::vec![Op::SleepFor(100), Op::Log("A")];
        let b = std::vec![Op::SleepFor(200), Op::Log("B")];
        let mut sim = Sim::new(std::vec![(parent, 0), (a, 0), (b, 0)]);
        sim.irqs.push((10, 1));

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.log, [("A", 10), ("B", 200)]);
        let p = sim.sched.platform();
        assert_eq!(p.arms, [100, 200]);
        assert_eq!(p.cancels, 1);
    }

    #[test]
    fn test_wake_is_idempotent_for_queued_task() {
        let parent = std::vec![Op::Start(1), Op::Start(1), Op::Wake(1), Op::Wake(1), Op::Log("P")];
        let a = std::vec![Op::SleepForever, Op::SleepForever, Op::Log("A")];
        let mut sim = Sim::new(std::vec![(parent, 0), (a, 0)]);

        sim.run_from_mainline(&[0]);

        // the second start finds A live and only yields; the second wake lands
        // while A is already queued and cancels A's next sleep instead
        assert_eq!(sim.names(), ["P", "A"]);
    }

    #[test]
    fn test_wake_before_sleep_is_not_lost() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b = Sim::bounds(0);
        let id = sched.spawn(b, b.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);
        assert_eq!(sched.current(), Some(id));

        // an interrupt wakes the task before it gets to sleep
        sched.wake(id);
        assert_eq!(sched.task(id).sleep_count, -1);

        sched.sleep_current(Instant::END_OF_TIME);
        assert_eq!(sched.switch_out(b.top - 56), Switch::Resume(b.top - 56));
        assert_eq!(sched.current(), Some(id));
        assert_eq!(sched.task(id).state, TaskState::Running);
        sched.assert_consistent();
    }

    #[test]
    fn test_expired_deadline_goes_straight_back_to_run_queue() {
        let a = std::vec![Op::SleepFor(0), Op::Log("A")];
        let mut sim = Sim::new(std::vec![(a, 0)]);

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.log, [("A", 0)]);
        assert!(sim.sched.platform().arms.is_empty());
        assert_eq!(sim.sched.task(sim.id(0)).sleep_count, 0);
    }

    #[test]
    fn test_signal_then_wait_does_not_suspend() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b = Sim::bounds(0);
        let id = sched.spawn(b, b.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);

        let mut w = WaitState::new();
        sched.signal(&mut w);
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Acquired);
        assert_eq!(sched.current(), Some(id));
        assert_eq!(sched.task(id).sleep_count, 0);
    }

    #[test]
    fn test_wait_then_signal_resumes_once() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b0 = Sim::bounds(0);
        let b1 = Sim::bounds(1);
        let waiter = sched.spawn(b0, b0.top - 56).unwrap();
        let other = sched.spawn(b1, b1.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);

        let mut w = WaitState::new();
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Parked);
        sched.switch_out(b0.top - 56);
        assert_eq!(sched.current(), Some(other));
        assert_eq!(sched.task(waiter).state, TaskState::Sleeping);

        // from an interrupt, say
        sched.signal(&mut w);
        assert_eq!(sched.task(waiter).state, TaskState::Ready);
        assert_eq!(w.waiter(), None);
        sched.assert_consistent();

        sched.switch_out(b1.top - 56);
        assert_eq!(sched.current(), Some(waiter));
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Acquired);
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Parked);
    }

    #[test]
    fn test_second_waiter_polls_instead_of_replacing_first() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b0 = Sim::bounds(0);
        let b1 = Sim::bounds(1);
        let first = sched.spawn(b0, b0.top - 56).unwrap();
        let second = sched.spawn(b1, b1.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);

        let mut w = WaitState::new();
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Parked);
        sched.switch_out(b0.top - 56);
        assert_eq!(sched.current(), Some(second));
        assert_eq!(sched.begin_wait(&mut w), WaitStep::Busy);
        assert_eq!(w.waiter(), Some(first));
        assert_eq!(sched.task(second).sleep_count, 0);
    }

    #[test]
    fn test_two_waiters_both_get_through() {
        let parent = std::vec![Op::Start(1), Op::Start(2), Op::Start(3)];
        let t1 = std::vec![Op::Wait(0), Op::Log("T1")];
        let t2 = std::vec![Op::Wait(0), Op::Log("T2")];
        let t3 = std::vec![Op::Yield, Op::Signal(0), Op::Yield, Op::Signal(0)];
        let mut sim = Sim::new(std::vec![(parent, 0), (t1, 0), (t2, 0), (t3, 0)]);

        sim.run_from_mainline(&[0]);

        // T1 holds the waiter slot; T2 polls and happens to grab the first
        // count, T1 gets the second
        assert_eq!(sim.names(), ["T2", "T1"]);
        assert_eq!(sim.waitables[0].count(), 0);
    }

    #[test]
    fn test_check_polls_without_parking() {
        let a = std::vec![Op::Check(0), Op::Signal(0), Op::Check(0), Op::Check(0)];
        let mut sim = Sim::new(std::vec![(a, 0)]);

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.names(), ["check-", "check+", "check-"]);
    }

    #[test]
    fn test_exit_latches_completion_for_every_joiner() {
        let parent = std::vec![Op::Start(1), Op::Join(1), Op::Join(1), Op::Join(1), Op::Log("P")];
        let child = std::vec![Op::Yield, Op::Yield];
        let mut sim = Sim::new(std::vec![(parent, 0), (child, 42)]);

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.joined, [42, 42, 42]);
        assert_eq!(sim.names(), ["P"]);
        let child = sim.sched.task(sim.id(1));
        assert_eq!(child.state, TaskState::Exited);
        assert_eq!(child.sp, INVALID_SP);
        assert!(child.done.is_latched());
        assert!(!sim.sched.is_live_stack(Sim::bounds(1)));
    }

    #[test]
    fn test_restart_reuses_slot_and_resets_completion() {
        let child = std::vec![Op::Log("C")];
        let mut sim = Sim::new(std::vec![(child, 7)]);

        sim.run_from_mainline(&[0]);
        let first = sim.id(0);
        assert_eq!(sim.sched.handle_of(Sim::bounds(0)).unwrap().exit_code, Some(7));

        sim.run_from_mainline(&[0]);
        let second = sim.id(0);
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert_eq!(sim.names(), ["C", "C"]);
        assert_eq!(sim.sched.task(second).generation, 2);
    }

    #[test]
    fn test_handle_of_unknown_stack_is_none() {
        let sched = Scheduler::new(FakePlatform::default());
        assert_eq!(sched.handle_of(Sim::bounds(3)), None);
        assert!(!sched.is_live_stack(Sim::bounds(3)));
    }

    #[test]
    fn test_arena_full_then_oldest_exited_slot_reused() {
        let mut sched = Scheduler::new(FakePlatform::default());
        for i in 0..MAX_TASKS - 1 {
            let b = Sim::bounds(i);
            sched.spawn(b, b.top - 56).unwrap();
        }
        let extra = Sim::bounds(MAX_TASKS);
        assert_eq!(sched.spawn(extra, extra.top - 56), Err(StartError::ArenaFull));

        // run the first two and let them exit
        sched.switch_out(MAINLINE_SP);
        for i in 0..2 {
            sched.exit_current(0);
            sched.switch_out(Sim::bounds(i).top - 56);
        }
        let oldest = sched.find(Sim::bounds(0)).unwrap();
        let reused = sched.spawn(extra, extra.top - 56).unwrap();
        assert_eq!(reused.index(), oldest.index());
        sched.assert_consistent();
    }

    /// Fills the arena, lets slot 1 exit and hands it to another stack.
    /// Returns the id of the exited run.
    fn recycle_first_slot(sched: &mut Scheduler<FakePlatform>) -> TaskId {
        for i in 0..MAX_TASKS - 1 {
            let b = Sim::bounds(i);
            sched.spawn(b, b.top - 56).unwrap();
        }
        sched.switch_out(MAINLINE_SP);
        let old = sched.current().unwrap();
        sched.exit_current(0);
        sched.switch_out(Sim::bounds(0).top - 56);

        let extra = Sim::bounds(MAX_TASKS);
        let new = sched.spawn(extra, extra.top - 56).unwrap();
        assert_eq!(new.index(), old.index());
        old
    }

    #[test]
    #[should_panic(expected = "earlier run of its slot")]
    fn test_stale_task_id_cannot_wake_new_occupant() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let old = recycle_first_slot(&mut sched);
        sched.wake(old);
    }

    #[test]
    fn test_recycled_slot_forgets_previous_stack() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let old = recycle_first_slot(&mut sched);
        assert_eq!(sched.handle_of(Sim::bounds(0)), None);
        let new = sched.find(Sim::bounds(MAX_TASKS)).unwrap();
        assert_eq!(new.index(), old.index());
        assert_eq!(sched.task(new).sleep_count, 0);

        // the new occupant still takes wakes addressed to it
        sched.wake(new);
        assert_eq!(sched.task(new).sleep_count, -1);
        sched.assert_consistent();
    }

    #[test]
    fn test_try_join_succeeds_repeatedly_after_exit() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b0 = Sim::bounds(0);
        let b1 = Sim::bounds(1);
        sched.spawn(b0, b0.top - 56).unwrap();
        let child = sched.spawn(b1, b1.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);

        // parent running, child queued behind it
        assert_eq!(sched.try_join(child), None);
        assert_eq!(sched.try_join(child), None);
        assert_eq!(sched.switch_out(b0.top - 56), Switch::Resume(b1.top - 56));
        sched.exit_current(9);
        assert_eq!(sched.switch_out(b1.top - 56), Switch::Resume(b0.top - 56));

        for _ in 0..3 {
            assert_eq!(sched.try_join(child), Some(9));
        }
        // never parked the caller
        assert_eq!(sched.task(sched.current().unwrap()).state, TaskState::Running);
        assert!(sched.timers.is_empty());
        sched.assert_consistent();
    }

    #[test]
    #[should_panic(expected = "never started")]
    fn test_try_join_of_vacant_slot_is_fatal() {
        let mut sched = Scheduler::new(FakePlatform::default());
        sched.try_join(TaskId::new(3));
    }

    #[test]
    fn test_guards_follow_task_lifetime() {
        let a = std::vec![Op::Yield];
        let mut sim = Sim::new(std::vec![(a, 0)]);

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.sched.platform().guard_log, [(true, 0), (false, 0)]);
        assert_eq!(sim.sched.task(sim.id(0)).guard, None);
    }

    #[test]
    #[should_panic(expected = "outside its stack")]
    fn test_corrupted_saved_sp_caught_before_resume() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b0 = Sim::bounds(0);
        let b1 = Sim::bounds(1);
        sched.spawn(b0, b0.top - 56).unwrap();
        let victim = sched.spawn(b1, b1.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);

        sched.tasks[victim.index()].sp = b1.bottom - 64;
        sched.switch_out(b0.top - 56);
    }

    #[test]
    #[should_panic(expected = "outside its stack")]
    fn test_overflowed_sp_caught_on_switch_out() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b = Sim::bounds(0);
        sched.spawn(b, b.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);
        sched.switch_out(b.bottom);
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn test_wake_of_exited_task_is_fatal() {
        let mut sim = Sim::new(std::vec![(std::vec![], 0)]);
        sim.run_from_mainline(&[0]);
        let id = sim.id(0);
        sim.sched.wake(id);
    }

    #[test]
    fn test_idle_until_interrupt_wakes_indefinite_sleeper() {
        let a = std::vec![Op::SleepForever, Op::Log("A")];
        let mut sim = Sim::new(std::vec![(a, 0)]);
        sim.irqs.push((5, 0));

        sim.run_from_mainline(&[0]);

        assert_eq!(sim.log, [("A", 5)]);
    }

    #[cfg(feature = "track-execution-time")]
    #[test]
    fn test_execution_time_is_charged_to_running_task() {
        let mut sched = Scheduler::new(FakePlatform::default());
        let b = Sim::bounds(0);
        let id = sched.spawn(b, b.top - 56).unwrap();
        sched.switch_out(MAINLINE_SP);
        sched.platform_mut().now = 3;
        sched.switch_out(b.top - 56);
        assert_eq!(sched.task(id).time_executing, 3000);
    }
}
