//! Optional blocking of asynchronous signals around an event frame.
//!
//! With the `atomic_backtrace` feature enabled, a [`SignalGuard`] masks all
//! signals from the opening of an event frame through the commit of its
//! record, so a handler can never run an interposed function in the middle
//! of one and tear the record. Without the feature the guard compiles to a
//! no-op and reentry from a handler is handled (lossily) by the gate.

#[cfg(feature = "atomic_backtrace")]
mod imp {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

    use crate::output;

    pub struct SignalGuard {
        saved: SigSet,
    }

    impl SignalGuard {
        pub fn block() -> Self {
            let mut saved = SigSet::empty();
            if pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut saved))
                .is_err()
            {
                output::fatal(format_args!("unable to block signals"));
            }
            Self { saved }
        }
    }

    impl Drop for SignalGuard {
        fn drop(&mut self) {
            if pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None).is_err() {
                output::fatal(format_args!("unable to restore signal mask"));
            }
        }
    }
}

#[cfg(not(feature = "atomic_backtrace"))]
mod imp {
    pub struct SignalGuard(());

    impl SignalGuard {
        pub fn block() -> Self {
            Self(())
        }
    }
}

pub use imp::SignalGuard;

#[cfg(all(test, feature = "atomic_backtrace"))]
mod tests {
    use nix::sys::signal::{pthread_sigmask, SigSet, Signal, SigmaskHow};

    use super::*;

    #[test]
    fn guard_masks_and_restores() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _g = SignalGuard::block();
            let masked = SigSet::thread_get_mask().unwrap();
            assert!(masked.contains(Signal::SIGUSR1));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(
            after.contains(Signal::SIGUSR1),
            before.contains(Signal::SIGUSR1)
        );
        // Leave the mask as we found it even if the assertions above change.
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&before), None).unwrap();
    }
}
