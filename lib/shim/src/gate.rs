//! Per-thread reentrancy gate.
//!
//! The tracer's own machinery (symbol resolution, unwinding, output) calls
//! the very functions it interposes. A thread-local depth counter tells an
//! interposed call whether it is the outermost one on this thread. Only
//! the outermost call opens an event frame; nested calls forward straight
//! to the real function.

use core::cell::Cell;

thread_local! {
    static DEPTH: Cell<i32> = const { Cell::new(0) };
}

pub fn enter() {
    DEPTH.with(|d| d.set(d.get() + 1));
}

pub fn leave() {
    DEPTH.with(|d| d.set(d.get() - 1));
}

pub fn depth() -> i32 {
    DEPTH.with(|d| d.get())
}

/// True while the current call is the one that moved the depth from 0 to 1.
pub fn is_outermost() -> bool {
    depth() == 1
}

/// Marks the current thread suppressed for the guard's lifetime: interposed
/// calls made inside see a non-zero depth and bypass observation.
pub struct Suppression(());

impl Suppression {
    fn new() -> Self {
        enter();
        Self(())
    }
}

impl Drop for Suppression {
    fn drop(&mut self) {
        leave();
    }
}

pub fn suppress() -> Suppression {
    Suppression::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outermost_tracks_depth() {
        assert_eq!(depth(), 0);
        enter();
        assert!(is_outermost());
        enter();
        assert!(!is_outermost());
        assert_eq!(depth(), 2);
        leave();
        leave();
        assert_eq!(depth(), 0);
    }

    #[test]
    fn suppression_guard_restores_depth() {
        assert_eq!(depth(), 0);
        {
            let _g = suppress();
            assert_eq!(depth(), 1);
            let _g2 = suppress();
            assert_eq!(depth(), 2);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    fn depth_is_per_thread() {
        enter();
        std::thread::spawn(|| assert_eq!(depth(), 0)).join().unwrap();
        leave();
    }
}
