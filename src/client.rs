use async_trait::async_trait;
use std::sync::Arc;
use crate::error::MailError;
use crate::models::{SendQuota, SendRawEmailOutput, SendRawEmailRequest};

/// The two SES operations the mail backend relies on.
///
/// Provider-side failures come back as `MailError::RemoteRejected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SesClient: Send + Sync {
    async fn get_send_quota(&self) -> Result<SendQuota, MailError>;

    async fn send_raw_email(
        &self,
        request: &SendRawEmailRequest,
    ) -> Result<SendRawEmailOutput, MailError>;
}

/// Opens connections to SES.
pub trait SesConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn SesClient>, MailError>;
}
