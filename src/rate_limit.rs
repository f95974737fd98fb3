use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// How far back recorded sends still count against the rate limit.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(2);

/// Number of sends allowed inside one window before a delay kicks in.
pub fn capacity(rate_limit: f64, throttle_factor: f64) -> f64 {
    rate_limit * THROTTLE_WINDOW.as_secs_f64() * throttle_factor
}

// Send window - recent send timestamps, oldest first
#[derive(Debug, Default)]
pub struct SendWindow {
    sends: VecDeque<Instant>,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every send at or before `now - THROTTLE_WINDOW`.
    pub fn prune(&mut self, now: Instant) {
        if let Some(window_start) = now.checked_sub(THROTTLE_WINDOW) {
            self.sends.retain(|sent| *sent > window_start);
        }
    }

    /// Time to wait before the next send, if the window is over `threshold`.
    ///
    /// Expects a pruned window. A count equal to the threshold is still allowed.
    pub fn delay_for(&self, now: Instant, threshold: f64) -> Option<Duration> {
        if (self.sends.len() as f64) <= threshold {
            return None;
        }
        let oldest = *self.sends.front()?;
        let elapsed = now.saturating_duration_since(oldest);
        THROTTLE_WINDOW
            .checked_sub(elapsed)
            .filter(|delay| !delay.is_zero())
    }

    pub fn record(&mut self, now: Instant) {
        self.sends.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    // Recorded sends, oldest first
    pub fn timestamps(&self) -> Vec<Instant> {
        self.sends.iter().copied().collect()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.sends.front().copied()
    }
}
