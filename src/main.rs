//! # costack Example Firmware
//!
//! Exercises the scheduler with a handful of tasks:
//!
//! | Task | Stack | Behavior |
//! |------|-------|----------|
//! | `parent` | `PARENT_STACK` | Starts `child`, then yields in a loop |
//! | `child` | `CHILD_STACK` | Yields a few times and exits |
//! | `producer` | `PRODUCER_STACK` | Signals `DATA_READY` every 100 ms |
//! | `consumer` | `CONSUMER_STACK` | Waits on `DATA_READY`, counts items |
//! | `supervisor` | `SUPERVISOR_STACK` | Starts both, joins the producer, polls the consumer |
//!
//! ## Expected Output
//!
//! With a logger installed, `parent` and `child` interleave as
//! `child, parent, child, parent, child, parent, parent, parent`. After
//! that the consumer reports one item per producer period, and the
//! supervisor reports the producer's exit code once it has produced
//! `ITEMS` items.
//!
//! No logger is installed here; hook one up for the board at hand
//! (RTT, UART, semihosting) before `kernel::init()`.

#![no_std]
#![no_main]

use core::time::Duration;

use cortex_m_rt::entry;
use panic_halt as _;

use costack::config::DEFAULT_STACK_WORDS;
use costack::{kernel, Stack, Waitable};

const ITEMS: u32 = 5;

static PARENT_STACK: Stack<DEFAULT_STACK_WORDS> = Stack::new();
static CHILD_STACK: Stack<DEFAULT_STACK_WORDS> = Stack::new();
static PRODUCER_STACK: Stack<DEFAULT_STACK_WORDS> = Stack::new();
static CONSUMER_STACK: Stack<DEFAULT_STACK_WORDS> = Stack::new();
static SUPERVISOR_STACK: Stack<DEFAULT_STACK_WORDS> = Stack::new();

static DATA_READY: Waitable = Waitable::new();

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Starts `child`, then takes turns with it.
fn parent(rounds: u32) -> u32 {
    kernel::start(child, 3, &CHILD_STACK);
    for _ in 0..rounds {
        log::info!("parent");
        kernel::yield_now();
    }
    0
}

fn child(rounds: u32) -> u32 {
    for _ in 0..rounds {
        log::info!("child");
        kernel::yield_now();
    }
    rounds
}

/// Produces `items` items, one per 100 ms, then exits with the count.
fn producer(items: u32) -> u32 {
    for _ in 0..items {
        kernel::sleep(Duration::from_millis(100));
        kernel::signal(&DATA_READY);
    }
    items
}

fn consumer(items: u32) -> u32 {
    for n in 1..=items {
        kernel::wait(&DATA_READY);
        log::info!("consumed item {} at {}us", n, kernel::now().as_micros());
    }
    0
}

/// Runs the producer/consumer pair. `join()` needs a task to wait in.
fn supervisor(_: u32) -> u32 {
    kernel::start(consumer, ITEMS, &CONSUMER_STACK);
    kernel::start(producer, ITEMS, &PRODUCER_STACK);
    let produced = kernel::join(&PRODUCER_STACK);
    log::info!("producer finished after {} items", produced);
    // the consumer takes the last item shortly after
    let mut polls = 0;
    while kernel::try_join(&CONSUMER_STACK).is_none() {
        polls += 1;
    }
    log::info!("consumer done after {} polls", polls);
    0
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Starts the clock, runs the demo tasks to
/// completion, then sleeps forever.
#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().expect("peripherals already taken");
    kernel::init(&mut cp.SYST);

    // returns once parent and child are both done
    kernel::start(parent, 5, &PARENT_STACK);
    log::info!("child exited with {:?}", kernel::task_of(&CHILD_STACK));

    kernel::start(supervisor, 0, &SUPERVISOR_STACK);

    loop {
        cortex_m::asm::wfi();
    }
}
