use std::thread;
use std::time::{Duration, Instant};

/// Fixed-window dispatch limiter owned by the scheduler.
///
/// Up to `limit` dispatches are admitted per window. Once a window's batch
/// is used up, [`admit`](Self::admit) sleeps out the rest of the window.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    window: Duration,
    window_start: Option<Instant>,
    in_window: usize,
}

impl RateWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            window_start: None,
            in_window: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Block until one more dispatch is allowed. Returns the admission time.
    pub fn admit(&mut self) -> Instant {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);

        if elapsed >= self.window {
            self.window_start = Some(now);
            self.in_window = 0;
        } else if self.in_window >= self.limit {
            let remaining = self.window - elapsed;
            tracing::debug!(?remaining, "Rate limit reached, waiting for next window");
            thread::sleep(remaining);
            self.window_start = Some(Instant::now());
            self.in_window = 0;
        }

        self.in_window += 1;
        Instant::now()
    }
}
