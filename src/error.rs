use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

// Keys written onto a message when SES rejects it
pub const ERROR_KEYS: [&str; 6] = [
    "status",
    "reason",
    "body",
    "request_id",
    "error_code",
    "error_message",
];

/// Structured error returned by SES for a single request.
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("SES request failed with status {}: {}", .status.unwrap_or_default(), .error_code.as_deref().unwrap_or("Unknown"))]
pub struct ClientError {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub body: Option<String>,
    pub request_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ClientError {
    // Write every error field onto the metadata map, null when unknown
    pub fn annotate(&self, metadata: &mut BTreeMap<String, Value>) {
        let values = [
            self.status.map(Value::from),
            self.reason.clone().map(Value::from),
            self.body.clone().map(Value::from),
            self.request_id.clone().map(Value::from),
            self.error_code.clone().map(Value::from),
            self.error_message.clone().map(Value::from),
        ];
        for (key, value) in ERROR_KEYS.iter().zip(values) {
            metadata.insert(key.to_string(), value.unwrap_or(Value::Null));
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("SES connection unavailable: {0}")]
    RemoteUnavailable(String),

    #[error(transparent)]
    RemoteRejected(#[from] ClientError),

    #[error("SES transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid SES response: {0}")]
    InvalidResponse(String),

    #[error("DKIM signing failed: {0}")]
    Signing(String),

    #[error("bad header: {0}")]
    BadHeader(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_fills_every_key() {
        let err = ClientError {
            status: Some(400),
            error_code: Some("MessageRejected".to_string()),
            error_message: Some("Email address is not verified.".to_string()),
            ..Default::default()
        };
        let mut metadata = BTreeMap::new();
        err.annotate(&mut metadata);

        assert_eq!(metadata.len(), ERROR_KEYS.len());
        assert_eq!(metadata["status"], Value::from(400));
        assert_eq!(metadata["error_code"], Value::from("MessageRejected"));
        assert_eq!(metadata["reason"], Value::Null);
        assert_eq!(metadata["request_id"], Value::Null);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError {
            status: Some(400),
            error_code: Some("Throttling".to_string()),
            ..Default::default()
        };
        assert_eq!(
            err.to_string(),
            "SES request failed with status 400: Throttling"
        );
    }
}
