//! SES v2 HTTP transport.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, Response, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use crate::client::{SesClient, SesConnector};
use crate::config::SesSettings;
use crate::error::{ClientError, MailError};
use crate::models::{ResponseMetadata, SendQuota, SendRawEmailOutput, SendRawEmailRequest};
use crate::sigv4::{Credentials, sign_request};

const SERVICE: &str = "ses";
const ACCOUNT_PATH: &str = "/v2/email/account";
const OUTBOUND_EMAILS_PATH: &str = "/v2/email/outbound-emails";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountResponse {
    send_quota: Option<SendQuota>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailBody<'a> {
    from_email_address: &'a str,
    destination: Destination<'a>,
    content: Content,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Destination<'a> {
    to_addresses: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Content {
    raw: RawContent,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RawContent {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailResponse {
    message_id: String,
}

// SES error bodies use either spelling
#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// Signed client for one SES region endpoint.
pub struct HttpSesClient {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: Credentials,
}

impl HttpSesClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        region: String,
        credentials: Credentials,
    ) -> Self {
        Self {
            http,
            endpoint,
            region,
            credentials,
        }
    }

    async fn call(&self, method: Method, path: &str, body: Vec<u8>) -> Result<Response, MailError> {
        let url = self
            .endpoint
            .join(path)
            .map_err(|e| MailError::RemoteUnavailable(format!("bad SES endpoint: {}", e)))?;
        let headers = sign_request(
            &self.credentials,
            &self.region,
            SERVICE,
            method.as_str(),
            &url,
            &body,
            chrono::Utc::now(),
        );

        let mut request = self.http.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.header("content-type", "application/json").body(body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(client_error(response).await.into())
        }
    }
}

fn request_id(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-amzn-requestid")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// Turn a non-2xx SES response into the structured error
async fn client_error(response: Response) -> ClientError {
    let status = response.status();
    let request_id = request_id(&response);
    let error_code = response
        .headers()
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(':').next())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let body = response.text().await.ok();
    let error_message = body
        .as_deref()
        .and_then(|b| serde_json::from_str::<ErrorBody>(b).ok())
        .unwrap_or_default()
        .message;

    ClientError {
        status: Some(status.as_u16()),
        reason: status.canonical_reason().map(str::to_string),
        body,
        request_id,
        error_code,
        error_message,
    }
}

#[async_trait]
impl SesClient for HttpSesClient {
    async fn get_send_quota(&self) -> Result<SendQuota, MailError> {
        let response = self.call(Method::GET, ACCOUNT_PATH, Vec::new()).await?;
        let bytes = response.bytes().await?;
        let account: AccountResponse = serde_json::from_slice(&bytes)
            .map_err(|e| MailError::InvalidResponse(format!("GetAccount: {}", e)))?;
        account
            .send_quota
            .ok_or_else(|| MailError::InvalidResponse("GetAccount: missing SendQuota".to_string()))
    }

    async fn send_raw_email(
        &self,
        request: &SendRawEmailRequest,
    ) -> Result<SendRawEmailOutput, MailError> {
        let body = SendEmailBody {
            from_email_address: &request.source,
            destination: Destination {
                to_addresses: &request.destinations,
            },
            content: Content {
                raw: RawContent {
                    data: STANDARD.encode(&request.raw_message),
                },
            },
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| MailError::InvalidResponse(format!("SendEmail body: {}", e)))?;

        let response = self.call(Method::POST, OUTBOUND_EMAILS_PATH, payload).await?;
        let status = response.status().as_u16();
        let request_id = request_id(&response);
        let bytes = response.bytes().await?;
        let sent: SendEmailResponse = serde_json::from_slice(&bytes)
            .map_err(|e| MailError::InvalidResponse(format!("SendEmail: {}", e)))?;

        Ok(SendRawEmailOutput {
            message_id: sent.message_id,
            response_metadata: ResponseMetadata {
                http_status_code: status,
                request_id,
            },
        })
    }
}

/// Builds an `HttpSesClient` from the configured credentials and endpoint.
pub struct HttpSesConnector {
    credentials: Option<Credentials>,
    region: String,
    endpoint: String,
    timeout: Duration,
}

impl HttpSesConnector {
    pub fn new(settings: &SesSettings) -> Self {
        Self {
            credentials: settings.credentials.clone(),
            region: settings.region.clone(),
            endpoint: settings.endpoint(),
            timeout: settings.request_timeout,
        }
    }
}

impl SesConnector for HttpSesConnector {
    fn connect(&self) -> Result<Arc<dyn SesClient>, MailError> {
        let credentials = self
            .credentials
            .clone()
            .ok_or_else(|| MailError::RemoteUnavailable("no AWS credentials configured".to_string()))?;
        let endpoint = Url::parse(&self.endpoint).map_err(|e| {
            MailError::RemoteUnavailable(format!("invalid SES endpoint {}: {}", self.endpoint, e))
        })?;
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| MailError::RemoteUnavailable(format!("HTTP client: {}", e)))?;

        debug!(endpoint = %endpoint, region = %self.region, "SES connection opened");
        Ok(Arc::new(HttpSesClient::new(
            http,
            endpoint,
            self.region.clone(),
            credentials,
        )))
    }
}
