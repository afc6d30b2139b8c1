//! # Task Control Block
//!
//! Defines the task model for costack. A task is a slot in the scheduler's
//! arena ([`TaskControlBlock`], named by a [`TaskId`]) plus a caller-owned
//! [`Stack`]. The scheduler never allocates: stacks are `static`s owned by
//! whoever starts the task, and the arena is a fixed-size array.
//!
//! ## Saved context
//!
//! A suspended task is fully described by its saved stack pointer. The
//! context-switch primitive leaves this frame below it (ascending addresses):
//!
//! ```text
//!   sp + 0  .. sp + 4    r8, r9, r10, r11, r12
//!   sp + 5  .. sp + 12   r0 .. r7
//!   sp + 13              return address
//! ```
//!
//! A fresh task gets a hand-made frame of the same shape whose `r0`/`r1`
//! carry the entry function and its parameter, and whose return address is
//! the trampoline that calls `entry(param)` and then exits the task.

use core::cell::UnsafeCell;
use core::fmt;

use crate::config::{GUARD_BYTES, MIN_STACK_WORDS, STACK_FILL};
use crate::list::{Link, Links};
use crate::time::Instant;
use crate::waitable::WaitState;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Names one run of a task: the arena slot it occupies plus the start count
/// of that slot, so an id kept past the task's exit never names whatever
/// runs in the slot next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    slot: u8,
    generation: u32,
}

impl TaskId {
    /// Slot 0 stands for the original, non-task flow of control that called
    /// `start()` first.
    pub const MAINLINE: TaskId = TaskId::new(0);

    /// Id of slot `index` with generation 0.
    pub const fn new(index: usize) -> Self {
        Self::with_generation(index, 0)
    }

    pub const fn with_generation(index: usize, generation: u32) -> Self {
        assert!(index <= u8::MAX as usize);
        TaskId {
            slot: index as u8,
            generation,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.slot as usize
    }

    /// Which start of the slot this id belongs to.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn is_mainline(self) -> bool {
        self.slot == 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_mainline() {
            f.write_str("mainline")
        } else {
            write!(f, "#{}", self.slot)
        }
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Where a task currently is.
///
/// ```text
///               start()
///   Vacant ───────────────► Ready ◄──────────────┐
///                            │  ▲                 │ wake / alarm
///                 switch_out │  │ yield           │
///                            ▼  │                 │
///                          Running ──────────► Sleeping
///                            │     wait_until
///                            │ exit
///                            ▼
///                          Exited ──── start() ───► Ready
/// ```
///
/// `Running` is the head of the run queue, `Ready` the rest of it, and
/// `Sleeping` the timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Never started.
    Vacant,
    /// In the run queue, waiting for its turn.
    Ready,
    /// Currently executing.
    Running,
    /// In the timer queue, waiting for a deadline or an explicit wake.
    Sleeping,
    /// Finished; the slot may be reused.
    Exited,
    /// Mainline only: parked while tasks run, resumed once they have drained.
    Parked,
}

/// Entry point of a task. The return value becomes the exit code.
pub type TaskFn = fn(u32) -> u32;

/// Saved stack pointer of a task that has exited. Resuming it faults right
/// away, and it can never look like a live pointer into a stack.
pub const INVALID_SP: usize = 1;

/// Number of words in a saved context frame.
pub const FRAME_WORDS: usize = 14;

/// Words at the bottom of every stack that the stack guard makes
/// inaccessible.
#[cfg(feature = "stack-guard")]
pub const GUARDED_WORDS: usize = GUARD_BYTES / 4;
#[cfg(not(feature = "stack-guard"))]
pub const GUARDED_WORDS: usize = 0;

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Address range of a task stack, `bottom..top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub bottom: usize,
    pub top: usize,
}

impl StackBounds {
    pub const EMPTY: StackBounds = StackBounds { bottom: 0, top: 0 };

    /// Liveness check: a saved stack pointer of a suspended task lies strictly
    /// inside its stack. Both ends are excluded: an untouched stack has
    /// `sp == top`, and a stack that has been eaten entirely has `sp <= bottom`.
    #[inline]
    pub const fn holds(&self, sp: usize) -> bool {
        self.bottom < sp && sp < self.top
    }

    pub const fn len(&self) -> usize {
        self.top - self.bottom
    }

    pub const fn is_empty(&self) -> bool {
        self.top == self.bottom
    }
}

/// Backing storage for one task: `WORDS` 32-bit words of stack, aligned so
/// that the bottom can be covered by a stack guard.
///
/// Declare one `static` per task:
///
/// ```ignore
/// static BLINKY: Stack<256> = Stack::new();
/// costack::start(blinky, 0, &BLINKY);
/// ```
#[repr(C, align(32))]
pub struct Stack<const WORDS: usize> {
    words: UnsafeCell<[u32; WORDS]>,
}

// Safety: the words are only written by `prepare()`, under the scheduler lock
// and only while no live task runs on them, and afterwards only by the task
// that owns the stack.
unsafe impl<const WORDS: usize> Sync for Stack<WORDS> {}

impl<const WORDS: usize> Default for Stack<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> Stack<WORDS> {
    pub const fn new() -> Self {
        assert!(WORDS >= MIN_STACK_WORDS + GUARD_BYTES / 4);
        // keeps the top 8-byte aligned, as calls expect
        assert!(WORDS % 2 == 0);
        Self {
            words: UnsafeCell::new([0; WORDS]),
        }
    }

    pub fn bounds(&self) -> StackBounds {
        let bottom = self.words.get() as usize;
        StackBounds {
            bottom,
            top: bottom + WORDS * 4,
        }
    }

    /// High-water mark: words at the bottom of the stack never written since
    /// the task was started. Words under the stack guard are counted as
    /// untouched and never read, since reading them faults.
    pub fn unused_words(&self) -> usize {
        let base = self.words.get() as *const u32;
        // Safety: the slice starts above the guard and ends at the top of the
        // stack. Single core; a concurrent write by the owning task can only
        // make the count stale, and the words are plain integers.
        let above = unsafe {
            core::slice::from_raw_parts(base.add(GUARDED_WORDS), WORDS - GUARDED_WORDS)
        };
        GUARDED_WORDS + untouched_words(above)
    }

    /// Fills the whole stack with [`STACK_FILL`].
    ///
    /// # Safety
    /// Nothing may be running on this stack.
    pub(crate) unsafe fn paint(&self) {
        (*self.words.get()).fill(STACK_FILL);
    }

    /// Fills the stack with [`STACK_FILL`] and lays down an initial frame.
    /// Returns the stack pointer to resume.
    ///
    /// # Safety
    /// No live task may be running on this stack.
    pub(crate) unsafe fn prepare(&self, entry: TaskFn, param: u32, trampoline: usize) -> usize {
        let words = &mut *self.words.get();
        let offset = build_frame(words, entry as usize as u32, param, trampoline as u32);
        self.bounds().bottom + offset * 4
    }
}

/// Fills `words` with the debug pattern and builds a fresh context frame at
/// the top. Returns the word offset of the new stack pointer.
pub fn build_frame(words: &mut [u32], entry: u32, param: u32, trampoline: u32) -> usize {
    assert!(words.len() >= FRAME_WORDS, "stack too small for a frame");
    words.fill(STACK_FILL);

    let sp = words.len() - FRAME_WORDS;
    let frame = &mut words[sp..];
    // r8..r12
    frame[..5].fill(0);
    // r0, r1
    frame[5] = entry;
    frame[6] = param;
    // r2..r7
    frame[7..13].fill(0);
    frame[13] = trampoline;
    sp
}

/// Number of words from the bottom of `words` that still hold the fill
/// pattern, i.e. stack that has never been touched.
pub fn untouched_words(words: &[u32]) -> usize {
    words.iter().take_while(|&&w| w == STACK_FILL).count()
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Per-task metadata, one per arena slot.
pub struct TaskControlBlock {
    /// Saved stack pointer. Only meaningful while the task is not running.
    pub sp: usize,

    /// The task's stack. Empty for the mainline and for vacant slots.
    pub stack: StackBounds,

    /// Queue membership.
    pub link: Link,

    pub state: TaskState,

    /// Set by `exit()`: the next switch retires the task instead of
    /// re-queueing it.
    pub exiting: bool,

    /// Positive while the task sleeps. A wake that arrives before the task
    /// gets to sleep drives it negative, which cancels the next sleep.
    pub sleep_count: i8,

    /// Deadline of the current sleep; [`Instant::END_OF_TIME`] means none.
    pub wake_at: Instant,

    /// Valid once the task has exited.
    pub exit_code: u32,

    /// Latched when the task exits.
    pub done: WaitState,

    /// MPU region protecting the bottom of the stack, if one is installed.
    pub guard: Option<u8>,

    /// Bumped on every start, so slots can be reused oldest-first.
    pub generation: u32,

    /// Microseconds spent executing.
    #[cfg(feature = "track-execution-time")]
    pub time_executing: u64,
}

impl TaskControlBlock {
    /// A never-used slot. Used to initialize the static arena.
    pub const VACANT: TaskControlBlock = TaskControlBlock {
        sp: 0,
        stack: StackBounds::EMPTY,
        link: Link::UNLINKED,
        state: TaskState::Vacant,
        exiting: false,
        sleep_count: 0,
        wake_at: Instant::END_OF_TIME,
        exit_code: 0,
        done: WaitState::new(),
        guard: None,
        generation: 0,
        #[cfg(feature = "track-execution-time")]
        time_executing: 0,
    };

    /// Re-initializes the slot for a freshly prepared stack.
    pub fn init(&mut self, stack: StackBounds, sp: usize, generation: u32) {
        debug_assert!(!self.link.is_linked());
        *self = TaskControlBlock {
            sp,
            stack,
            generation,
            state: TaskState::Ready,
            ..TaskControlBlock::VACANT
        };
    }

    /// Whether the slot holds a task that has been started and not exited,
    /// judged by its saved stack pointer.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.stack.holds(self.sp)
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleep_count > 0
    }

    pub fn handle(&self, id: TaskId) -> TaskHandle {
        TaskHandle {
            id,
            state: self.state,
            exit_code: (self.state == TaskState::Exited).then_some(self.exit_code),
            wake_at: (self.state == TaskState::Sleeping).then_some(self.wake_at),
            #[cfg(feature = "track-execution-time")]
            time_executing: self.time_executing,
        }
    }
}

impl Links for [TaskControlBlock] {
    fn link(&self, id: TaskId) -> &Link {
        &self[id.index()].link
    }

    fn link_mut(&mut self, id: TaskId) -> &mut Link {
        &mut self[id.index()].link
    }
}

/// Read-only snapshot of a task, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    pub state: TaskState,
    /// `Some` once the task has exited.
    pub exit_code: Option<u32>,
    /// `Some` while the task sleeps; [`Instant::END_OF_TIME`] for an
    /// indefinite sleep.
    pub wake_at: Option<Instant>,
    #[cfg(feature = "track-execution-time")]
    pub time_executing: u64,
}

impl TaskHandle {
    pub fn is_live(&self) -> bool {
        !matches!(self.state, TaskState::Vacant | TaskState::Exited)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
