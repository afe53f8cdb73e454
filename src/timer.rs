use std::time::{Duration, Instant};

/// Counter-with-top periodic timer.
///
/// `overflow()` is a level test (elapsed >= top); call sites `reset()` at the
/// end of every tick, so ticks missed while a long AT transaction held the
/// thread coalesce into a single execution on the next entry.
#[derive(Debug)]
pub struct Counter {
    top: Duration,
    start: Instant,
}

impl Counter {
    pub fn new(top: Duration) -> Self {
        Counter {
            top,
            start: Instant::now(),
        }
    }

    pub fn from_secs(top: f64) -> Self {
        Counter::new(Duration::from_secs_f64(top.max(0.0)))
    }

    /// Changes the period without restarting the current window.
    pub fn set_top(&mut self, top: Duration) {
        self.top = top;
    }

    pub fn set_top_secs(&mut self, top: f64) {
        self.set_top(Duration::from_secs_f64(top.max(0.0)));
    }

    pub fn overflow(&self) -> bool {
        self.start.elapsed() >= self.top
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}
