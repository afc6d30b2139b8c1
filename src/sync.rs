//! # Synchronization Primitives
//!
//! The scheduler has exactly one lock: a critical section. On the target it
//! masks interrupts (cortex-m's single-core implementation of the
//! `critical-section` crate); host tests get the `std` implementation.
//!
//! Every queue mutation, every [`Waitable`](crate::Waitable) update and every
//! alarm decision happens inside it. It is also what makes `wake`/`signal`
//! callable from interrupt handlers: an interrupt can never observe the
//! queues half-updated.

use ::critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Sections nest; interrupts come back on only when the outermost one ends.
/// Keep them short: nothing in the scheduler blocks or switches while
/// holding one, and neither should callers.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // access shared state through `Mutex::borrow(cs)`
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    ::critical_section::with(f)
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use ::critical_section::Mutex;

    use super::*;

    #[test]
    fn test_sections_nest() {
        static DEPTH: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));
        let inner = critical_section(|cs| {
            DEPTH.borrow(cs).set(1);
            critical_section(|cs| {
                let d = DEPTH.borrow(cs);
                d.set(d.get() + 1);
                d.get()
            })
        });
        assert_eq!(inner, 2);
    }

    #[test]
    fn test_refcell_state_survives_across_sections() {
        static LOG: Mutex<RefCell<[u8; 4]>> = Mutex::new(RefCell::new([0; 4]));
        for i in 0..4u8 {
            critical_section(|cs| LOG.borrow_ref_mut(cs)[i as usize] = i + 1);
        }
        let got = critical_section(|cs| *LOG.borrow_ref(cs));
        assert_eq!(got, [1, 2, 3, 4]);
    }
}
