// Daemon signal handling.
//
// Registers handlers for SIGTERM/SIGINT/SIGQUIT/SIGHUP (graceful shutdown
// flag) and SIGUSR1 (skip-delays wake flag, consumed once per main-loop
// iteration). Handlers only set atomic flags; all I/O happens in the
// supervisor loop that polls them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shared atomic flags checked by the supervisor loops.
///
/// Signal handlers set these flags asynchronously; the supervisors read them
/// between ticks. `wake` is level-triggered for one iteration: reading it
/// through [`SignalFlags::take_wake`] resets it.
#[derive(Clone)]
pub struct SignalFlags {
    /// Set when SIGTERM, SIGINT, SIGQUIT or SIGHUP is received. The daemon
    /// kills its workers and exits at the next check.
    shutdown: Arc<AtomicBool>,
    /// Set when SIGUSR1 is received. The daemon bypasses its batching delays
    /// for the next pass.
    wake: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Creates a new set of signal flags with all flags initially unset.
    ///
    /// Useful in tests that drive loop logic without installing handlers.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers Unix signal handlers and returns the shared flags.
    ///
    /// - **SIGTERM**, **SIGINT**, **SIGQUIT** and **SIGHUP** set `shutdown`.
    /// - **SIGUSR1** sets `wake`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if signal registration fails.
    pub fn register() -> io::Result<Self> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};

        let flags = Self::unregistered();

        for sig in [SIGTERM, SIGINT, SIGQUIT, SIGHUP] {
            signal_hook::flag::register(sig, Arc::clone(&flags.shutdown))?;
        }
        signal_hook::flag::register(SIGUSR1, Arc::clone(&flags.wake))?;

        Ok(flags)
    }

    /// Reports whether graceful shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Consumes the USR1 wake flag, returning whether it was set.
    ///
    /// The flag resets on read so one signal bypasses delays for exactly one
    /// pass.
    #[must_use]
    pub fn take_wake(&self) -> bool {
        self.wake.swap(false, Ordering::Relaxed)
    }

    /// Peeks at the USR1 wake flag without consuming it. Used to cut the
    /// main-loop sleep short; the flag itself is consumed at the top of the
    /// next iteration.
    #[must_use]
    pub fn wake_pending(&self) -> bool {
        self.wake.load(Ordering::Relaxed)
    }

    /// Sets the wake flag directly. Test hook.
    pub fn raise_wake(&self) {
        self.wake.store(true, Ordering::Relaxed);
    }

    /// Sets the shutdown flag directly. Test hook.
    pub fn raise_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Why an interruptible sleep returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepInterrupt {
    /// Slept the full duration.
    Completed,
    /// USR1 arrived; the caller should start its next pass now.
    Woken,
    /// Shutdown was requested.
    Shutdown,
}

/// Sleeps up to `duration`, returning early when a signal flag is raised.
///
/// Polls in short slices so a 60 s tick interval does not delay shutdown or
/// a USR1 wake by more than a fraction of a second.
pub fn sleep_interruptible(flags: &SignalFlags, duration: Duration) -> SleepInterrupt {
    const SLICE: Duration = Duration::from_millis(200);
    let deadline = Instant::now() + duration;
    loop {
        if flags.shutdown_requested() {
            return SleepInterrupt::Shutdown;
        }
        if flags.wake_pending() {
            return SleepInterrupt::Woken;
        }
        let now = Instant::now();
        if now >= deadline {
            return SleepInterrupt::Completed;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod signal_tests {
    use super::*;

    #[test]
    fn flags_default_to_false() {
        let flags = SignalFlags::unregistered();
        assert!(!flags.shutdown_requested());
        assert!(!flags.take_wake());
    }

    #[test]
    fn wake_flag_is_consumed_on_read() {
        let flags = SignalFlags::unregistered();
        flags.raise_wake();
        assert!(flags.take_wake());
        assert!(!flags.take_wake());
    }

    #[test]
    fn shutdown_flag_is_sticky() {
        let flags = SignalFlags::unregistered();
        flags.raise_shutdown();
        assert!(flags.shutdown_requested());
        assert!(flags.shutdown_requested());
    }

    #[test]
    fn register_signal_handlers_succeeds() {
        let result = SignalFlags::register();
        assert!(result.is_ok());
    }

    #[test]
    fn sleep_cut_short_by_wake() {
        let flags = SignalFlags::unregistered();
        flags.raise_wake();
        let start = Instant::now();
        let outcome = sleep_interruptible(&flags, Duration::from_secs(30));
        assert_eq!(outcome, SleepInterrupt::Woken);
        assert!(start.elapsed() < Duration::from_secs(1));
        // Peeking did not consume the flag.
        assert!(flags.take_wake());
    }

    #[test]
    fn sleep_completes_when_undisturbed() {
        let flags = SignalFlags::unregistered();
        let outcome = sleep_interruptible(&flags, Duration::from_millis(10));
        assert_eq!(outcome, SleepInterrupt::Completed);
    }
}
