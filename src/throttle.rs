use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;
use crate::metrics::{THROTTLE_DELAY_SECONDS, THROTTLE_DELAYS};
use crate::rate_limit::capacity;
use crate::state::ThrottleState;

/// Default fraction of the SES max send rate to aim for.
pub const DEFAULT_THROTTLE_FACTOR: f64 = 0.5;

/// Paces sends so the recent count stays under a fraction of the SES rate.
///
/// The window lock is held from pruning through the delay to the append, so
/// concurrent senders sharing one `ThrottleState` queue up behind each other
/// instead of racing on the window.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    state: Arc<ThrottleState>,
    factor: f64,
}

impl ThrottleController {
    /// `None` when throttling is disabled (no factor, or a factor <= 0).
    pub fn new(state: Arc<ThrottleState>, factor: Option<f64>) -> Option<Self> {
        match factor {
            Some(factor) if factor > 0.0 => Some(Self { state, factor }),
            _ => None,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Wait as long as needed before sending now, then record the send.
    ///
    /// `now` is read once the window lock is held, so a sender that queued
    /// behind another one's delay sees the time it actually got its turn.
    /// Returns the delay that was applied.
    pub async fn maybe_delay(&self, rate_limit: f64) -> Duration {
        let mut window = self.state.window.lock().await;
        let now = Instant::now();
        window.prune(now);

        let threshold = capacity(rate_limit, self.factor);
        let delay = window.delay_for(now, threshold);
        if let Some(delay) = delay {
            debug!(
                recent_sends = window.len(),
                threshold,
                delay_s = delay.as_secs_f64(),
                "send_messages.throttle delaying"
            );
            THROTTLE_DELAYS.inc();
            THROTTLE_DELAY_SECONDS.observe(delay.as_secs_f64());
            sleep(delay).await;
        }

        window.record(now);
        delay.unwrap_or_default()
    }
}
