//! Mail backend that sends through SES.
//!
//! One `SesBackend` is built per batch. Throttle bookkeeping lives in the
//! `ThrottleState` it is given, so sharing that state is what makes several
//! backends count against the same SES quota.

use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::cache::make_cache_key;
use crate::client::{SesClient, SesConnector};
use crate::config::SesSettings;
use crate::dkim::{MessageSigner, signer_for};
use crate::error::MailError;
use crate::metrics::{EMAILS_FAILED, EMAILS_SENT, MAX_SEND_RATE};
use crate::models::{EmailMessage, SendRawEmailRequest};
use crate::state::ThrottleState;
use crate::throttle::ThrottleController;

pub struct SesBackend {
    fail_silently: bool,
    connector: Arc<dyn SesConnector>,
    connection: Option<Arc<dyn SesClient>>,
    state: Arc<ThrottleState>,
    throttle: Option<ThrottleController>,
    signer: Arc<dyn MessageSigner>,
    credential_key: String,
    default_from_email: String,
}

impl SesBackend {
    pub fn new(
        settings: &SesSettings,
        connector: Arc<dyn SesConnector>,
        state: Arc<ThrottleState>,
        signer: Arc<dyn MessageSigner>,
    ) -> Self {
        Self {
            fail_silently: settings.fail_silently,
            connector,
            connection: None,
            throttle: ThrottleController::new(state.clone(), settings.auto_throttle),
            state,
            signer,
            credential_key: make_cache_key(settings.access_key_id()),
            default_from_email: settings.default_from_email.clone(),
        }
    }

    /// Build with the DKIM signer the settings call for.
    pub fn from_settings(
        settings: &SesSettings,
        connector: Arc<dyn SesConnector>,
        state: Arc<ThrottleState>,
    ) -> Result<Self, MailError> {
        let signer = signer_for(&settings.dkim)?;
        Ok(Self::new(settings, connector, state, signer))
    }

    pub fn with_fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    pub fn fail_silently(&self) -> bool {
        self.fail_silently
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Open a connection to SES unless one is already open.
    ///
    /// Returns whether a new connection was created. With fail-silently a
    /// connection failure leaves the backend closed and returns `Ok(false)`.
    pub fn open(&mut self) -> Result<bool, MailError> {
        if self.connection.is_some() {
            return Ok(false);
        }
        match self.connector.connect() {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(true)
            }
            Err(e) if self.fail_silently => {
                warn!(error = %e, "SES connection failed, failing silently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn close(&mut self) {
        self.connection = None;
    }

    /// Max sends per second for these credentials, from cache or SES.
    pub async fn get_rate_limit(&mut self) -> Result<f64, MailError> {
        if let Some(rate_limit) = self.state.rate_limits.get(&self.credential_key) {
            return Ok(rate_limit);
        }

        let new_conn_created = self.open()?;
        let result = self.fetch_rate_limit().await;
        if new_conn_created {
            self.close();
        }
        result
    }

    async fn fetch_rate_limit(&self) -> Result<f64, MailError> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            MailError::RemoteUnavailable(
                "no connection is available to check the current SES rate limit".to_string(),
            )
        })?;
        let quota = connection.get_send_quota().await?;
        self.state
            .rate_limits
            .insert(&self.credential_key, quota.max_send_rate);
        MAX_SEND_RATE.set(quota.max_send_rate);
        Ok(quota.max_send_rate)
    }

    /// Send each message in order and return how many SES accepted.
    ///
    /// `Ok(None)` for an empty batch, or when no connection could be opened
    /// while failing silently. Results are written to each message's
    /// metadata, including on the message that aborts the batch.
    pub async fn send_messages(
        &mut self,
        messages: &mut [EmailMessage],
    ) -> Result<Option<usize>, MailError> {
        if messages.is_empty() {
            return Ok(None);
        }

        let new_conn_created = self.open()?;
        if self.connection.is_none() {
            return Ok(None);
        }

        let result = self.send_all(messages).await;
        if new_conn_created {
            self.close();
        }
        result.map(Some)
    }

    async fn send_all(&mut self, messages: &mut [EmailMessage]) -> Result<usize, MailError> {
        let mut num_sent = 0;
        for message in messages.iter_mut() {
            if let Some(throttle) = self.throttle.clone() {
                let rate_limit = self.get_rate_limit().await?;
                debug!(rate_limit, "send_messages.throttle");
                throttle.maybe_delay(rate_limit).await;
            }

            if self.send_one(message).await? {
                num_sent += 1;
            }
        }
        Ok(num_sent)
    }

    // Ok(false) when SES rejected the message and we are failing silently
    async fn send_one(&self, message: &mut EmailMessage) -> Result<bool, MailError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| MailError::RemoteUnavailable("connection closed".to_string()))?;

        let raw = message.message(&self.default_from_email)?;
        let request = SendRawEmailRequest {
            source: self.default_from_email.clone(),
            destinations: message.recipients(),
            raw_message: self.signer.sign(raw.as_bytes())?,
        };

        match connection.send_raw_email(&request).await {
            Ok(output) => {
                let metadata = &mut message.metadata;
                metadata.insert(
                    "status".to_string(),
                    Value::from(output.response_metadata.http_status_code),
                );
                metadata.insert("message_id".to_string(), Value::from(output.message_id.clone()));
                metadata.insert(
                    "request_id".to_string(),
                    Value::from(output.response_metadata.request_id.clone()),
                );
                EMAILS_SENT.inc();
                debug!(
                    from = %message.from_email.as_deref().unwrap_or(&self.default_from_email),
                    recipients = %request.destinations.join(", "),
                    message_id = %output.message_id,
                    request_id = ?output.response_metadata.request_id,
                    "send_messages.sent"
                );
                Ok(true)
            }
            Err(MailError::RemoteRejected(err)) => {
                err.annotate(&mut message.metadata);
                EMAILS_FAILED.inc();
                warn!(
                    recipients = %request.destinations.join(", "),
                    error = %err,
                    "send_messages.failed"
                );
                if self.fail_silently {
                    Ok(false)
                } else {
                    Err(MailError::RemoteRejected(err))
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockSesClient;
    use crate::dkim::NoopSigner;
    use crate::error::ClientError;
    use crate::models::{ResponseMetadata, SendQuota, SendRawEmailOutput};
    use crate::sigv4::Credentials;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestConnector {
        client: Option<Arc<MockSesClient>>,
        connects: AtomicUsize,
    }

    impl TestConnector {
        fn new(client: MockSesClient) -> Arc<Self> {
            Arc::new(Self {
                client: Some(Arc::new(client)),
                connects: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                client: None,
                connects: AtomicUsize::new(0),
            })
        }
    }

    impl SesConnector for TestConnector {
        fn connect(&self) -> Result<Arc<dyn SesClient>, MailError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match &self.client {
                Some(client) => Ok(client.clone()),
                None => Err(MailError::RemoteUnavailable("unreachable".to_string())),
            }
        }
    }

    fn settings(throttle: Option<f64>, fail_silently: bool) -> SesSettings {
        SesSettings {
            credentials: Some(Credentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            }),
            auto_throttle: throttle,
            default_from_email: "noreply@example.com".to_string(),
            fail_silently,
            ..SesSettings::default()
        }
    }

    fn backend(
        connector: Arc<TestConnector>,
        throttle: Option<f64>,
        fail_silently: bool,
        state: Arc<ThrottleState>,
    ) -> SesBackend {
        SesBackend::new(
            &settings(throttle, fail_silently),
            connector,
            state,
            Arc::new(NoopSigner),
        )
    }

    fn message(to: &str) -> EmailMessage {
        EmailMessage::new("from@example.com", &[to], "Subject", "Body")
    }

    fn accepted(id: &str) -> Result<SendRawEmailOutput, MailError> {
        Ok(SendRawEmailOutput {
            message_id: id.to_string(),
            response_metadata: ResponseMetadata {
                http_status_code: 200,
                request_id: Some(format!("req-{}", id)),
            },
        })
    }

    fn rejected() -> Result<SendRawEmailOutput, MailError> {
        Err(MailError::RemoteRejected(ClientError {
            status: Some(400),
            reason: Some("Bad Request".to_string()),
            body: Some(r#"{"message":"Email address is not verified."}"#.to_string()),
            request_id: Some("req-err".to_string()),
            error_code: Some("MessageRejected".to_string()),
            error_message: Some("Email address is not verified.".to_string()),
        }))
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_calls() {
        let mut client = MockSesClient::new();
        client.expect_get_send_quota().times(0);
        client.expect_send_raw_email().times(0);
        let connector = TestConnector::new(client);
        let mut backend = backend(connector.clone(), Some(0.5), false, ThrottleState::shared(None));

        assert_eq!(backend.send_messages(&mut []).await.unwrap(), None);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_message_success() {
        let mut client = MockSesClient::new();
        client
            .expect_get_send_quota()
            .times(1)
            .returning(|| Ok(SendQuota { max_send_rate: 14.0, ..Default::default() }));
        client
            .expect_send_raw_email()
            .times(1)
            .withf(|request| {
                request.source == "noreply@example.com"
                    && request.destinations == vec!["to@example.com".to_string()]
                    && String::from_utf8_lossy(&request.raw_message).contains("Subject: Subject\r\n")
            })
            .returning(|_| accepted("msg-1"));
        let connector = TestConnector::new(client);
        let mut backend = backend(connector.clone(), Some(0.5), false, ThrottleState::shared(None));

        let mut messages = vec![message("to@example.com")];
        assert_eq!(backend.send_messages(&mut messages).await.unwrap(), Some(1));

        let metadata = &messages[0].metadata;
        assert_eq!(metadata["status"], Value::from(200));
        assert_eq!(metadata["message_id"], Value::from("msg-1"));
        assert_eq!(metadata["request_id"], Value::from("req-msg-1"));
        // the nested rate-limit lookup reused the batch connection
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(!backend.is_open());
    }

    #[tokio::test]
    async fn test_rejection_propagates_with_metadata() {
        let mut client = MockSesClient::new();
        client.expect_send_raw_email().times(1).returning(|_| rejected());
        let mut backend = backend(TestConnector::new(client), None, false, ThrottleState::shared(None));

        let mut messages = vec![message("a@example.com"), message("b@example.com")];
        let err = backend.send_messages(&mut messages).await.unwrap_err();

        assert!(matches!(err, MailError::RemoteRejected(_)));
        let metadata = &messages[0].metadata;
        assert_eq!(metadata["status"], Value::from(400));
        assert_eq!(metadata["error_code"], Value::from("MessageRejected"));
        assert_eq!(metadata["request_id"], Value::from("req-err"));
        assert_eq!(metadata["reason"], Value::from("Bad Request"));
        // the batch stopped at the first failure
        assert!(messages[1].metadata.is_empty());
        assert!(!backend.is_open());
    }

    #[tokio::test]
    async fn test_fail_silently_continues_after_rejection() {
        let mut client = MockSesClient::new();
        let calls = Mutex::new(0);
        client.expect_send_raw_email().times(2).returning(move |_| {
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 { rejected() } else { accepted("msg-2") }
        });
        let mut backend = backend(TestConnector::new(client), None, true, ThrottleState::shared(None));

        let mut messages = vec![message("a@example.com"), message("b@example.com")];
        assert_eq!(backend.send_messages(&mut messages).await.unwrap(), Some(1));
        assert_eq!(messages[0].metadata["error_code"], Value::from("MessageRejected"));
        assert!(!messages[0].metadata.contains_key("message_id"));
        assert_eq!(messages[1].metadata["message_id"], Value::from("msg-2"));
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let mut messages = vec![message("a@example.com")];

        let mut silent = backend(TestConnector::failing(), Some(0.5), true, ThrottleState::shared(None));
        assert_eq!(silent.send_messages(&mut messages).await.unwrap(), None);

        let mut loud = backend(TestConnector::failing(), Some(0.5), false, ThrottleState::shared(None));
        let err = loud.send_messages(&mut messages).await.unwrap_err();
        assert!(matches!(err, MailError::RemoteUnavailable(_)));
        assert!(messages[0].metadata.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_without_connection_is_an_error() {
        let mut backend = backend(TestConnector::failing(), Some(0.5), true, ThrottleState::shared(None));
        let err = backend.get_rate_limit().await.unwrap_err();
        assert!(matches!(err, MailError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_is_cached_across_backends() {
        let mut client = MockSesClient::new();
        client
            .expect_get_send_quota()
            .times(1)
            .returning(|| Ok(SendQuota { max_send_rate: 14.0, ..Default::default() }));
        let connector = TestConnector::new(client);
        let state = ThrottleState::shared(None);

        let mut first = backend(connector.clone(), Some(0.5), false, state.clone());
        assert_eq!(first.get_rate_limit().await.unwrap(), 14.0);
        assert!(!first.is_open());

        let mut second = backend(connector.clone(), Some(0.5), false, state);
        assert_eq!(second.get_rate_limit().await.unwrap(), 14.0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quota_failure_is_fatal_even_when_silent() {
        let mut client = MockSesClient::new();
        client.expect_get_send_quota().times(1).returning(|| {
            Err(MailError::RemoteRejected(ClientError {
                status: Some(403),
                ..Default::default()
            }))
        });
        client.expect_send_raw_email().times(0);
        let mut backend = backend(TestConnector::new(client), Some(0.5), true, ThrottleState::shared(None));

        let mut messages = vec![message("a@example.com")];
        assert!(backend.send_messages(&mut messages).await.is_err());
    }

    #[tokio::test]
    async fn test_caller_opened_connection_stays_open() {
        let mut client = MockSesClient::new();
        client.expect_send_raw_email().times(2).returning(|_| accepted("msg"));
        let mut backend = backend(TestConnector::new(client), None, false, ThrottleState::shared(None));

        assert!(backend.open().unwrap());
        assert!(!backend.open().unwrap());
        let mut messages = vec![message("a@example.com")];
        backend.send_messages(&mut messages).await.unwrap();
        assert!(backend.is_open());
        backend.send_messages(&mut messages).await.unwrap();
        backend.close();
        assert!(!backend.is_open());
    }

    #[tokio::test]
    async fn test_disabled_throttle_skips_bookkeeping() {
        let mut client = MockSesClient::new();
        client.expect_get_send_quota().times(0);
        client.expect_send_raw_email().times(50).returning(|_| accepted("msg"));
        let state = ThrottleState::shared(None);
        let mut backend = backend(TestConnector::new(client), Some(0.0), false, state.clone());

        let mut messages: Vec<_> = (0..50).map(|_| message("a@example.com")).collect();
        assert_eq!(backend.send_messages(&mut messages).await.unwrap(), Some(50));
        assert_eq!(state.recent_sends().await, 0);
        assert!(state.rate_limits.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_batch_records_every_send() {
        let mut client = MockSesClient::new();
        client
            .expect_get_send_quota()
            .times(1)
            .returning(|| Ok(SendQuota { max_send_rate: 1.0, ..Default::default() }));
        client.expect_send_raw_email().times(4).returning(|_| accepted("msg"));
        let state = ThrottleState::shared(None);
        let mut backend = backend(TestConnector::new(client), Some(0.5), false, state.clone());

        // threshold 1: the third send waits out the window
        let started = Instant::now();
        let mut messages: Vec<_> = (0..4).map(|_| message("a@example.com")).collect();
        assert_eq!(backend.send_messages(&mut messages).await.unwrap(), Some(4));
        assert!(Instant::now() - started >= std::time::Duration::from_secs(2));
        assert!(state.recent_sends().await >= 1);
    }

    #[tokio::test]
    async fn test_missing_request_id_is_null() {
        let mut client = MockSesClient::new();
        client.expect_send_raw_email().times(1).returning(|_| {
            Ok(SendRawEmailOutput {
                message_id: "msg-1".to_string(),
                response_metadata: ResponseMetadata {
                    http_status_code: 200,
                    request_id: None,
                },
            })
        });
        let mut backend = backend(TestConnector::new(client), None, false, ThrottleState::shared(None));

        let mut messages = vec![message("a@example.com")];
        assert_eq!(backend.send_messages(&mut messages).await.unwrap(), Some(1));
        assert_eq!(messages[0].metadata["request_id"], Value::Null);
        assert_eq!(messages[0].metadata["message_id"], Value::from("msg-1"));
    }

    #[tokio::test]
    async fn test_header_injection_fails_even_when_silent() {
        let mut client = MockSesClient::new();
        client.expect_send_raw_email().times(0);
        let mut backend = backend(TestConnector::new(client), None, true, ThrottleState::shared(None));

        let mut bad = message("a@example.com");
        bad.subject = "Hi\r\nBcc: victim@example.com".to_string();
        let err = backend.send_messages(&mut [bad]).await.unwrap_err();
        assert!(matches!(err, MailError::BadHeader(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_refetched_after_ttl() {
        let mut client = MockSesClient::new();
        client
            .expect_get_send_quota()
            .times(2)
            .returning(|| Ok(SendQuota { max_send_rate: 14.0, ..Default::default() }));
        let connector = TestConnector::new(client);
        let state = ThrottleState::shared(Some(std::time::Duration::from_secs(60)));
        let mut backend = backend(connector.clone(), Some(0.5), false, state);

        assert_eq!(backend.get_rate_limit().await.unwrap(), 14.0);
        tokio::time::advance(std::time::Duration::from_secs(59)).await;
        assert_eq!(backend.get_rate_limit().await.unwrap(), 14.0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert_eq!(backend.get_rate_limit().await.unwrap(), 14.0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
