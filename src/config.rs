//! # costack Configuration
//!
//! Compile-time constants governing the scheduler. All limits are fixed at
//! compile time; nothing is allocated dynamically.

/// Number of task slots in the scheduler arena, including slot 0 which is
/// reserved for the mainline pseudo-task. Each slot is a few dozen bytes; the
/// stacks themselves are owned by the caller.
pub const MAX_TASKS: usize = 16;

/// Size of the scheduler-only stack in 32-bit words. `switch_out()` and
/// everything it calls run on this stack, so tasks do not have to provision
/// room for the scheduler.
pub const SCHEDULER_STACK_WORDS: usize = 512;

/// Smallest task stack in words. This is just enough to call `start()` from
/// a task to launch others; anything doing formatted output needs a lot more.
pub const MIN_STACK_WORDS: usize = 64;

/// Default task stack size in words.
pub const DEFAULT_STACK_WORDS: usize = 256;

/// Pattern written over fresh stacks, so high-water marks and stray reads
/// are easy to spot in a debugger.
pub const STACK_FILL: u32 = 0xdead_beef;

/// Bytes at the bottom of each stack covered by the overflow guard.
/// Stacks are aligned to this.
pub const GUARD_BYTES: usize = 32;

/// Number of MPU regions on the part (Cortex-M0+ implements 8).
pub const MPU_REGIONS: u8 = 8;

/// MPU regions the scheduler must leave alone. The runtime uses the highest
/// region for its own main-stack guard.
pub const MPU_RESERVED_REGIONS: u8 = 1;

/// SysTick frequency in Hz. The alarm resolution is one tick.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (RP2040 default of 125 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 125_000_000;
