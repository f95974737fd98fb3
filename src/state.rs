use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use crate::cache::RateLimitCache;
use crate::models::BatchedSend;
use crate::rate_limit::SendWindow;

/// Throttle bookkeeping shared by every backend built from it.
///
/// Backends that should count against the same SES quota must share one
/// `Arc<ThrottleState>`; separate states are fully isolated.
#[derive(Debug, Default)]
pub struct ThrottleState {
    pub rate_limits: RateLimitCache,
    pub(crate) window: Mutex<SendWindow>,
}

impl ThrottleState {
    pub fn new(rate_limit_ttl: Option<Duration>) -> Self {
        Self {
            rate_limits: RateLimitCache::new(rate_limit_ttl),
            window: Mutex::new(SendWindow::new()),
        }
    }

    pub fn shared(rate_limit_ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self::new(rate_limit_ttl))
    }

    // Number of sends currently recorded in the window (unpruned)
    pub async fn recent_sends(&self) -> usize {
        self.window.lock().await.len()
    }
}

// app's shared state
pub struct AppState {
    pub batch_tx: mpsc::Sender<BatchedSend>,
}
