//! Cooperative shutdown.
//!
//! One flag is shared by the signal handler, the supervisor, and every
//! project loop. Long sleeps are sliced so a signal interrupts them
//! within a fraction of a second.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the
    /// sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_triggered() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn sleep_completes_when_not_triggered() {
        let flag = ShutdownFlag::new();
        assert!(flag.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn triggered_flag_interrupts_sleep_quickly() {
        let flag = ShutdownFlag::new();
        let background = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            background.trigger();
        });

        let started = Instant::now();
        let completed = flag.sleep(Duration::from_secs(30));
        handle.join().unwrap();

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_sleep_reports_trigger_state() {
        let flag = ShutdownFlag::new();
        assert!(flag.sleep(Duration::ZERO));
        flag.trigger();
        assert!(!flag.sleep(Duration::ZERO));
    }
}
