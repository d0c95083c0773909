use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Deadline::after(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let wait = match deadline.remaining() {
                Some(remaining) if remaining.is_zero() => return true,
                Some(remaining) => POLL_INTERVAL.min(remaining),
                None => POLL_INTERVAL,
            };
            thread::sleep(wait);
        }
    }
}

/// Point in time a wait gives up at. Durations too large for `Instant` never
/// expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn is_past(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}
