use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};
use crate::backend::SesBackend;
use crate::client::SesConnector;
use crate::config::SesSettings;
use crate::dkim::MessageSigner;
use crate::metrics::SEND_LATENCY;
use crate::models::{BatchedSend, SendOutcome};
use crate::state::ThrottleState;


// Background worker -> sends queued batches one by one, in arrival order
pub async fn send_worker(
    mut rx: mpsc::Receiver<BatchedSend>,
    settings: SesSettings,
    connector: Arc<dyn SesConnector>,
    state: Arc<ThrottleState>,
    signer: Arc<dyn MessageSigner>,
) {
    info!("Send worker started - processing batches sequentially");

    // keep receiving batches from the queue
    while let Some(batch) = rx.recv().await {
        let BatchedSend {
            mut messages,
            fail_silently,
            response_tx,
        } = batch;
        let start_time = Instant::now();

        // a fresh backend per batch, sharing the throttle state
        let mut backend =
            SesBackend::new(&settings, connector.clone(), state.clone(), signer.clone())
                .with_fail_silently(fail_silently.unwrap_or(settings.fail_silently));

        let result = backend.send_messages(&mut messages).await.map_err(|e| {
            error!(error = %e, batch_size = messages.len(), "[Worker] batch failed");
            e.to_string()
        });
        SEND_LATENCY.observe(start_time.elapsed().as_secs_f64());

        if let Ok(sent) = &result {
            info!(sent = ?sent, batch_size = messages.len(), "[Worker] batch done");
        }
        // Send outcome back to handler
        let _ = response_tx.send(SendOutcome { result, messages });
    }
}
