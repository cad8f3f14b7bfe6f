use std::time::Instant;

use flume::{Receiver, RecvTimeoutError};

/// Why a deadline wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Woken,
}

/// Time source for the scheduler.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Block until `deadline`, or until something arrives on `wake`.
    fn wait_until(&self, deadline: Instant, wake: &Receiver<()>) -> WaitOutcome;
}

/// Monotonic wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wait_until(&self, deadline: Instant, wake: &Receiver<()>) -> WaitOutcome {
        match wake.recv_deadline(deadline) {
            Ok(()) => WaitOutcome::Woken,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Elapsed,
            // No waker left: nothing can interrupt us, so sleep out the slot.
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                WaitOutcome::Elapsed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn elapses_at_deadline() {
        let (_tx, rx) = flume::unbounded();
        let start = Instant::now();
        let outcome = SystemClock.wait_until(start + Duration::from_millis(20), &rx);
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wakes_early() {
        let (tx, rx) = flume::unbounded();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.send(()).unwrap();
        });
        let start = Instant::now();
        let outcome = SystemClock.wait_until(start + Duration::from_secs(10), &rx);
        waker.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
