use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;
use crate::metrics::REQUEST_TOTAL;
use crate::models::{BatchedSend, SendRequest, SendResponse};
use crate::state::AppState;

type ErrorResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, error: &str, messages: Value) -> ErrorResponse {
    (status, Json(json!({ "error": error, "messages": messages })))
}

pub async fn send_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendRequest>,
) -> Result<Json<SendResponse>, ErrorResponse> {
    REQUEST_TOTAL.inc();

    // reject header injection before anything is queued
    if let Some(err) = payload.messages.iter().find_map(|m| m.validate().err()) {
        warn!(error = %err, "rejecting send request");
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &err.to_string(),
            serde_json::to_value(&payload.messages).unwrap_or(Value::Null),
        ));
    }

    let (response_tx, response_rx) = oneshot::channel();

    let batched = BatchedSend {
        messages: payload.messages,
        fail_silently: payload.fail_silently,
        response_tx,
    };

    state.batch_tx.send(batched).await.map_err(|_| {
        warn!("send worker queue closed");
        error_response(StatusCode::SERVICE_UNAVAILABLE, "Failed to queue messages", json!([]))
    })?;

    let outcome = response_rx.await.map_err(|_| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Worker failed to respond", json!([]))
    })?;

    match outcome.result {
        Ok(sent) => Ok(Json(SendResponse {
            sent,
            messages: outcome.messages,
        })),
        Err(e) => Err(error_response(
            StatusCode::BAD_GATEWAY,
            &e,
            serde_json::to_value(&outcome.messages).unwrap_or(Value::Null),
        )),
    }
}
