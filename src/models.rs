use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use crate::error::MailError;

// Outgoing email message, annotated with send results in `metadata`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EmailMessage {
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub html_body: Option<String>,
    // extra outgoing headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl EmailMessage {
    pub fn new(from_email: &str, to: &[&str], subject: &str, body: &str) -> Self {
        Self {
            from_email: Some(from_email.to_string()),
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: subject.to_string(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    /// Every envelope recipient: `to`, then `cc`, then `bcc`.
    pub fn recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .cloned()
            .collect()
    }

    /// Reject line breaks in anything that ends up in a header or the envelope.
    pub fn validate(&self) -> Result<(), MailError> {
        if let Some(from) = &self.from_email {
            check_value("from_email", from)?;
        }
        for (field, addresses) in [
            ("to", &self.to),
            ("cc", &self.cc),
            ("bcc", &self.bcc),
            ("reply_to", &self.reply_to),
        ] {
            for address in addresses {
                check_value(field, address)?;
            }
        }
        check_value("subject", &self.subject)?;
        for (name, value) in &self.headers {
            check_name(name)?;
            check_value(name, value)?;
        }
        Ok(())
    }

    /// Render the raw RFC 5322 form (CRLF line endings).
    ///
    /// `default_from` is used when the message has no sender of its own.
    /// `Bcc` recipients are never written into the headers. Fails with
    /// `MailError::BadHeader` when a header would contain a line break.
    pub fn message(&self, default_from: &str) -> Result<String, MailError> {
        self.validate()?;
        check_value("from_email", default_from)?;
        let from = self.from_email.as_deref().unwrap_or(default_from);
        let mut out = String::new();

        push_header(&mut out, "From", from);
        if !self.to.is_empty() {
            push_header(&mut out, "To", &self.to.join(", "));
        }
        if !self.cc.is_empty() {
            push_header(&mut out, "Cc", &self.cc.join(", "));
        }
        if !self.reply_to.is_empty() {
            push_header(&mut out, "Reply-To", &self.reply_to.join(", "));
        }
        push_header(&mut out, "Subject", &encode_header_value(&self.subject));
        if !self.has_header("Date") {
            push_header(&mut out, "Date", &chrono::Utc::now().to_rfc2822());
        }
        if !self.has_header("Message-ID") {
            let domain = from.rsplit('@').next().unwrap_or("localhost");
            let id = format!("<{}@{}>", uuid::Uuid::new_v4().simple(), domain);
            push_header(&mut out, "Message-ID", &id);
        }
        push_header(&mut out, "MIME-Version", "1.0");

        match &self.html_body {
            None => {
                push_header(&mut out, "Content-Type", "text/plain; charset=\"utf-8\"");
                push_header(&mut out, "Content-Transfer-Encoding", "8bit");
                self.push_extra_headers(&mut out);
                out.push_str("\r\n");
                out.push_str(&normalize_newlines(&self.body));
            }
            Some(html) => {
                let boundary = format!("==={}==", uuid::Uuid::new_v4().simple());
                push_header(
                    &mut out,
                    "Content-Type",
                    &format!("multipart/alternative; boundary=\"{}\"", boundary),
                );
                self.push_extra_headers(&mut out);
                out.push_str("\r\n");
                push_part(&mut out, &boundary, "text/plain", &self.body);
                push_part(&mut out, &boundary, "text/html", html);
                out.push_str(&format!("--{}--\r\n", boundary));
            }
        }
        Ok(out)
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    fn push_extra_headers(&self, out: &mut String) {
        for (name, value) in &self.headers {
            push_header(out, name, value);
        }
    }
}

fn check_value(field: &str, value: &str) -> Result<(), MailError> {
    if value.contains(['\r', '\n']) {
        return Err(MailError::BadHeader(format!(
            "header values can't contain newlines ({}: {:?})",
            field, value
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), MailError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    if !valid {
        return Err(MailError::BadHeader(format!("invalid header name {:?}", name)));
    }
    Ok(())
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn push_part(out: &mut String, boundary: &str, content_type: &str, body: &str) {
    out.push_str(&format!("--{}\r\n", boundary));
    push_header(out, "Content-Type", &format!("{}; charset=\"utf-8\"", content_type));
    push_header(out, "Content-Transfer-Encoding", "8bit");
    out.push_str("\r\n");
    out.push_str(&normalize_newlines(body));
    out.push_str("\r\n");
}

// RFC 2047 encoded-word for non-ASCII header values
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(value))
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

// SES GetAccount / GetSendQuota result
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendQuota {
    #[serde(default)]
    pub max_24_hour_send: f64,
    pub max_send_rate: f64,
    #[serde(default)]
    pub sent_last_24_hours: f64,
}

// Arguments of a SendRawEmail call
#[derive(Debug, Clone, PartialEq)]
pub struct SendRawEmailRequest {
    pub source: String,
    pub destinations: Vec<String>,
    pub raw_message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub http_status_code: u16,
    // None when SES sent no x-amzn-RequestId header
    pub request_id: Option<String>,
}

// SendRawEmail result
#[derive(Debug, Clone, PartialEq)]
pub struct SendRawEmailOutput {
    pub message_id: String,
    pub response_metadata: ResponseMetadata,
}

// POST /api/send body
#[derive(Debug, Deserialize, Serialize)]
pub struct SendRequest {
    pub messages: Vec<EmailMessage>,
    #[serde(default)]
    pub fail_silently: Option<bool>,
}

// POST /api/send success body
#[derive(Debug, Deserialize, Serialize)]
pub struct SendResponse {
    pub sent: Option<usize>,
    pub messages: Vec<EmailMessage>,
}

// Result of one queued batch: the count (or error text) and the annotated messages
pub struct SendOutcome {
    pub result: Result<Option<usize>, String>,
    pub messages: Vec<EmailMessage>,
}

// Batched send - holds the messages + response channel
pub struct BatchedSend {
    pub messages: Vec<EmailMessage>,
    pub fail_silently: Option<bool>,
    pub response_tx: oneshot::Sender<SendOutcome>, // one-time channel to send back the outcome
}
