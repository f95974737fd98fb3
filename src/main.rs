use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser; // for cli
use ses_gateway::config::Args;
use ses_gateway::dkim::signer_for;
use ses_gateway::handlers::{health_handler, metrics_handler, send_handler};
use ses_gateway::models::BatchedSend;
use ses_gateway::ses::HttpSesConnector;
use ses_gateway::state::{AppState, ThrottleState};
use ses_gateway::worker::send_worker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<()> {
    // parse cli arguments
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let settings = args.settings();
    if settings.credentials.is_none() {
        warn!("No AWS credentials configured, every send will fail to connect");
    }

    let signer = signer_for(&settings.dkim).context("invalid DKIM settings")?;
    let connector = Arc::new(HttpSesConnector::new(&settings));
    let throttle_state = ThrottleState::shared(settings.rate_limit_ttl);
    let (batch_tx, batch_rx) = mpsc::channel::<BatchedSend>(args.queue_size);

    // spawn the background worker
    tokio::spawn(send_worker(
        batch_rx,
        settings.clone(),
        connector,
        throttle_state,
        signer,
    ));

    let state = Arc::new(AppState { batch_tx });

    //creating the router with routes
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/send", post(send_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(port = args.port, "Gateway running on http://localhost:{}", args.port);
    info!(endpoint = %settings.endpoint(), region = %settings.region, "Sending through SES");
    match settings.auto_throttle.filter(|f| *f > 0.0) {
        Some(factor) => info!(factor, "Auto throttle enabled"),
        None => info!("Auto throttle disabled"),
    }
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
