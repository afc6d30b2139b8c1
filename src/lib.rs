//! # costack: cooperative stack-switching tasks
//!
//! A cooperative, non-preemptive task scheduler for single-core Cortex-M
//! microcontrollers, without any dynamic memory allocation.
//!
//! ## Overview
//!
//! Every task has its own stack and runs until it gives the processor away:
//! it yields, sleeps until a deadline, sleeps until explicitly woken, waits
//! on a [`Waitable`], or returns. Nothing ever preempts a task, so code
//! between two such calls runs atomically with respect to other tasks (not
//! to interrupt handlers).
//!
//! - **Run queue**: strict FIFO. A yielding task goes to the back.
//! - **Timer queue**: sleepers sorted by deadline, served by one alarm armed
//!   for the soonest of them.
//! - **Interrupts** may `wake` a task or `signal` a waitable; neither ever
//!   switches.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   start · yield_now · wait_until · wait · signal · join │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Waitable         │  Sync Primitives  │
//! │  scheduler.rs│   waitable.rs      │  sync.rs          │
//! │  ─ switch_out│   ─ signal()       │  ─ critical_section│
//! │  ─ wake()    │   ─ try_acquire()  │                   │
//! │  ─ on_alarm()│                    │                   │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │       Task Model (task.rs) · Lists (list.rs)           │
//! │   TCB · Stack · TaskState · run/timer TaskList          │
//! ├────────────────────────────────────────────────────────┤
//! │         Arch Port (arch/cortex_m.rs, guard.rs)          │
//! │   switch · scheduler stack · SysTick alarm · MPU guard  │
//! ├────────────────────────────────────────────────────────┤
//! │        ARM Cortex-M0+ and up (Thumb-1 switch path)      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Starting Tasks
//!
//! The first `start()` from `main()` turns the caller into the *mainline*:
//! it is parked while tasks run and resumed once none are left, at which
//! point `start()` returns. A task can start more tasks; `start()` then
//! queues the new one and yields.
//!
//! ## Memory Model
//!
//! - **No heap**: the task arena is a fixed `[TaskControlBlock; MAX_TASKS]`
//! - **Caller-owned stacks**: one `static` [`Stack`] per task
//! - **One lock**: a `critical-section` critical section, see [`sync`]
//!
//! ## Features
//!
//! - `track-execution-time`: microseconds spent running, per task
//! - `stack-guard`: no-access MPU region under every stack
//! - `ram-functions`: switch path linked into RAM
//! - `demo`: example firmware

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod time;
pub mod list;
pub mod waitable;
pub mod task;
pub mod guard;
pub mod scheduler;
pub mod sync;
pub mod arch;
pub mod kernel;

pub use kernel::Executor;
pub use scheduler::{Platform, Scheduler, StartError, Switch};
pub use task::{Stack, StackBounds, TaskFn, TaskHandle, TaskId, TaskState};
pub use time::Instant;
pub use waitable::Waitable;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use kernel::{
    check, current, exit, join, now, signal, sleep, start, task_of, try_join, wait,
    wait_forever, wait_until, wake, yield_now,
};
