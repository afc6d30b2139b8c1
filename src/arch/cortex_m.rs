//! # Cortex-M Port Layer
//!
//! Hardware-specific code for ARMv6-M (Cortex-M0+) and later. Implements the
//! context switch, the scheduler stack, a SysTick-driven clock and alarm, and
//! MPU stack guards.
//!
//! ## Context Switch Mechanism
//!
//! There is no PendSV and no PSP: everything runs in Thread mode on the main
//! stack pointer, and a switch is an ordinary function call. [`switch`]
//! pushes the caller's registers onto the caller's own stack, moves to the
//! scheduler stack and calls [`costack_schedule`] with the old stack pointer.
//! Whatever stack pointer comes back is switched to and popped from, so the
//! call "returns" inside another task.
//!
//! Interrupts stay enabled throughout, except inside the scheduler's own
//! critical sections. An interrupt taken while a task is suspended in the
//! middle of a switch simply stacks onto whatever stack is current.

use core::arch::naked_asm;

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{SCHEDULER_STACK_WORDS, SYSTEM_CLOCK_HZ, TICK_HZ};
#[cfg(feature = "stack-guard")]
use crate::guard::{GuardRegion, GuardSlots};
use crate::kernel::global::SCHEDULER;
use crate::scheduler::{Platform, Switch};
use crate::sync;
use crate::task::{Stack, StackBounds, TaskFn};
use crate::time::Instant;

/// Microseconds per SysTick period.
const MICROS_PER_TICK: u64 = 1_000_000 / TICK_HZ as u64;

/// The stack `costack_schedule` and the idle loop run on.
static SCHEDULER_STACK: Stack<SCHEDULER_STACK_WORDS> = Stack::new();

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Clock, alarm and MPU state of the board.
pub struct Board {
    ticks: u64,
    alarm: Option<Instant>,
    #[cfg(feature = "stack-guard")]
    guards: GuardSlots,
    scheduler_stack_ready: bool,
}

impl Board {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            alarm: None,
            #[cfg(feature = "stack-guard")]
            guards: GuardSlots::new(),
            scheduler_stack_ready: false,
        }
    }

    /// Called from the SysTick handler. Returns whether the alarm is due.
    fn tick(&mut self) -> bool {
        self.ticks += 1;
        match self.alarm {
            Some(at) if at <= self.now() => {
                self.alarm = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for Board {
    fn now(&self) -> Instant {
        Instant::from_micros(self.ticks * MICROS_PER_TICK)
    }

    fn arm_alarm(&mut self, at: Instant) -> bool {
        if at <= self.now() {
            self.alarm = None;
            return false;
        }
        self.alarm = Some(at);
        true
    }

    fn cancel_alarm(&mut self) {
        self.alarm = None;
    }

    #[cfg(feature = "stack-guard")]
    fn install_guard(&mut self, stack: StackBounds) -> Option<u8> {
        let Some(region) = self.guards.claim(mpu::region_enabled) else {
            log::warn!("no MPU region left, stack at {:#x} is unguarded", stack.bottom);
            return None;
        };
        mpu::program(region, Some(GuardRegion::covering(stack.bottom)));
        Some(region)
    }

    #[cfg(feature = "stack-guard")]
    fn remove_guard(&mut self, region: u8) {
        mpu::program(region, None);
        self.guards.release(region);
    }

    /// Paints the scheduler stack and guards it, once.
    fn prepare_switch_stack(&mut self) {
        if self.scheduler_stack_ready {
            return;
        }
        // Safety: called from mainline before the first switch, so nothing
        // runs on it.
        unsafe { SCHEDULER_STACK.paint() };
        let guard = self.install_guard(SCHEDULER_STACK.bounds());
        log::debug!("scheduler stack ready, guard {:?}", guard);
        self.scheduler_stack_ready = true;
    }
}

// ---------------------------------------------------------------------------
// MPU
// ---------------------------------------------------------------------------

#[cfg(feature = "stack-guard")]
mod mpu {
    use cortex_m::peripheral::MPU;

    use crate::guard::GuardRegion;

    const CTRL_ENABLE: u32 = 1 << 0;
    const CTRL_PRIVDEFENA: u32 = 1 << 2;
    const RASR_ENABLE: u32 = 1;

    /// Whether someone else (the runtime, a driver) already uses `region`.
    pub(super) fn region_enabled(region: u8) -> bool {
        // Safety: the MPU is only touched with the scheduler lock held.
        let mpu = unsafe { &*MPU::PTR };
        unsafe { mpu.rnr.write(region as u32) };
        mpu.rasr.read() & RASR_ENABLE != 0
    }

    /// Writes (or, with `None`, disables) region `region`.
    pub(super) fn program(region: u8, guard: Option<GuardRegion>) {
        // Safety: the MPU is only touched with the scheduler lock held, and a
        // region only ever covers the bottom of a stack nobody should touch.
        let mpu = unsafe { &*MPU::PTR };
        unsafe {
            mpu.rnr.write(region as u32);
            match guard {
                Some(g) => {
                    mpu.rbar.write(g.rbar(region));
                    mpu.rasr.write(g.rasr());
                }
                None => mpu.rasr.write(0),
            }
            // default memory map for everything not covered by a region
            mpu.ctrl.write(CTRL_ENABLE | CTRL_PRIVDEFENA);
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}

// ---------------------------------------------------------------------------
// SysTick
// ---------------------------------------------------------------------------

/// Configure the SysTick timer as the scheduler clock.
///
/// Sets up SysTick to fire at `TICK_HZ` frequency using the processor
/// clock. Deadlines are rounded up to the next tick.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// SysTick exception handler: advances the clock and fires the alarm.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    sync::critical_section(|cs| {
        let mut sched = SCHEDULER.borrow_ref_mut(cs);
        if sched.platform_mut().tick() {
            sched.on_alarm();
        }
    });
}

// ---------------------------------------------------------------------------
// Context switch
// ---------------------------------------------------------------------------

/// Panics unless called from Thread mode. Switching from an interrupt
/// handler would strand the handler's frame on a task stack.
pub fn assert_thread_mode() {
    assert!(
        SCB::vect_active() == VectActive::ThreadMode,
        "scheduler call from an interrupt handler"
    );
}

/// Suspends the caller and resumes whatever the scheduler picks.
///
/// Frame left on the caller's stack, ascending from the saved sp:
/// r8-r12, r0-r7, return address. Fresh tasks get the same frame from
/// `Stack::prepare`, so their first resume "returns" into [`trampoline`]
/// with entry and parameter in r0/r1.
///
/// # Safety
/// Thread mode only, scheduler lock not held.
#[unsafe(naked)]
#[cfg_attr(feature = "ram-functions", link_section = ".data.costack_switch")]
pub unsafe extern "C" fn switch() {
    naked_asm!(
        "push {{lr}}",
        "push {{r0-r7}}",
        // no push for high registers on v6-M
        "mov r0, r8",
        "mov r1, r9",
        "mov r2, r10",
        "mov r3, r11",
        "mov r4, r12",
        "push {{r0-r4}}",

        "mov r0, sp",
        "ldr r1, ={stack}+{stack_bytes}",
        "mov sp, r1",
        "bl {schedule}",
        "mov sp, r0",

        "pop {{r0-r4}}",
        "mov r8, r0",
        "mov r9, r1",
        "mov r10, r2",
        "mov r11, r3",
        "mov r12, r4",
        "pop {{r0-r7}}",
        "pop {{pc}}",

        stack = sym SCHEDULER_STACK,
        stack_bytes = const SCHEDULER_STACK_WORDS * 4,
        schedule = sym costack_schedule,
    );
}

/// Runs on the scheduler stack. Takes the suspended task's sp, returns the
/// sp to resume, idling with `wfe` while only sleepers remain.
#[cfg_attr(feature = "ram-functions", link_section = ".data.costack_schedule")]
extern "C" fn costack_schedule(sp: usize) -> usize {
    let mut next = sync::critical_section(|cs| SCHEDULER.borrow_ref_mut(cs).switch_out(sp));
    loop {
        match next {
            Switch::Resume(sp) => return sp,
            Switch::Idle => {
                // An interrupt between the unlock and the wfe sets the event
                // register, so wfe falls straight through.
                cortex_m::asm::wfe();
                next = sync::critical_section(|cs| SCHEDULER.borrow_ref_mut(cs).poll_idle());
            }
        }
    }
}

/// First code a task runs. `entry` is a [`TaskFn`] passed through r0.
extern "C" fn trampoline(entry: usize, param: u32) -> ! {
    // Safety: `Stack::prepare` put a `TaskFn` here.
    let entry: TaskFn = unsafe { core::mem::transmute::<usize, TaskFn>(entry) };
    let code = entry(param);
    crate::kernel::exit(code)
}

/// Address a fresh frame returns to.
pub(crate) fn trampoline_addr() -> usize {
    trampoline as extern "C" fn(usize, u32) -> ! as usize
}

/// Words of the scheduler stack never touched so far. The guarded bottom is
/// counted as untouched.
pub fn scheduler_stack_unused() -> usize {
    SCHEDULER_STACK.unused_words()
}

/// Bounds of the scheduler stack.
pub fn scheduler_stack() -> StackBounds {
    SCHEDULER_STACK.bounds()
}
