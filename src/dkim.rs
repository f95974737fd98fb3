//! DKIM message signing.
//!
//! Signing is a pluggable strategy: [`NoopSigner`] passes messages through
//! untouched, [`DkimSigner`] prepends an `ed25519-sha256` DKIM-Signature
//! (RFC 6376 with RFC 8463 keys) using relaxed/relaxed canonicalization.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use crate::config::DkimSettings;
use crate::error::MailError;

pub trait MessageSigner: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MailError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl MessageSigner for NoopSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MailError> {
        Ok(message.to_vec())
    }
}

pub struct DkimSigner {
    domain: String,
    selector: String,
    headers: Vec<String>,
    key: SigningKey,
}

impl DkimSigner {
    pub fn new(domain: &str, selector: &str, headers: &[String], key: SigningKey) -> Self {
        Self {
            domain: domain.to_string(),
            selector: selector.to_string(),
            headers: headers.to_vec(),
            key,
        }
    }

    /// Build from a base64-encoded 32 byte Ed25519 seed.
    pub fn from_base64_key(
        domain: &str,
        selector: &str,
        headers: &[String],
        private_key: &str,
    ) -> Result<Self, MailError> {
        let bytes = STANDARD
            .decode(private_key.trim())
            .map_err(|e| MailError::Signing(format!("private key is not base64: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            MailError::Signing(format!("expected a 32 byte Ed25519 key, got {} bytes", bytes.len()))
        })?;
        Ok(Self::new(domain, selector, headers, SigningKey::from_bytes(&seed)))
    }

    fn signature_header(&self, message: &str, timestamp: i64) -> String {
        let (header_block, body) = split_message(message);
        let fields = parse_headers(header_block);
        let body_hash = STANDARD.encode(Sha256::digest(canonicalize_body(body).as_bytes()));

        // each listed header is signed once, using its last occurrence
        let mut signed = Vec::new();
        let mut hashed = String::new();
        for name in &self.headers {
            if let Some((field_name, value)) = fields
                .iter()
                .rev()
                .find(|(field_name, _)| field_name.eq_ignore_ascii_case(name))
            {
                if signed.iter().any(|s: &String| s.eq_ignore_ascii_case(field_name)) {
                    continue;
                }
                hashed.push_str(&canonicalize_header(field_name, value));
                hashed.push_str("\r\n");
                signed.push(field_name.to_ascii_lowercase());
            }
        }

        let unsigned = format!(
            "v=1; a=ed25519-sha256; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
            self.domain,
            self.selector,
            timestamp,
            signed.join(":"),
            body_hash
        );
        hashed.push_str(&canonicalize_header("DKIM-Signature", &unsigned));

        let digest = Sha256::digest(hashed.as_bytes());
        let signature = self.key.sign(digest.as_slice());
        format!(
            "DKIM-Signature: {}{}\r\n",
            unsigned,
            STANDARD.encode(signature.to_bytes())
        )
    }
}

impl MessageSigner for DkimSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, MailError> {
        let text = std::str::from_utf8(message)
            .map_err(|e| MailError::Signing(format!("message is not UTF-8: {}", e)))?;
        let header = self.signature_header(text, chrono::Utc::now().timestamp());
        debug!(domain = %self.domain, selector = %self.selector, "message DKIM signed");

        let mut signed = header.into_bytes();
        signed.extend_from_slice(message);
        Ok(signed)
    }
}

/// Pick the signer for the configured DKIM settings.
///
/// Without both a domain and a key, messages pass through unsigned.
pub fn signer_for(settings: &DkimSettings) -> Result<Arc<dyn MessageSigner>, MailError> {
    match (&settings.domain, &settings.private_key) {
        (Some(domain), Some(key)) => Ok(Arc::new(DkimSigner::from_base64_key(
            domain,
            &settings.selector,
            &settings.headers,
            key,
        )?)),
        _ => Ok(Arc::new(NoopSigner)),
    }
}

fn split_message(message: &str) -> (&str, &str) {
    if let Some(idx) = message.find("\r\n\r\n") {
        (&message[..idx + 2], &message[idx + 4..])
    } else if let Some(idx) = message.find("\n\n") {
        (&message[..idx + 1], &message[idx + 2..])
    } else {
        (message, "")
    }
}

// Unfolded (name, raw value) pairs in message order
fn parse_headers(block: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim_end().to_string(), value.to_string()));
        }
    }
    fields
}

fn collapse_whitespace(value: &str) -> String {
    value.split([' ', '\t']).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")
}

// relaxed header canonicalization, without the trailing CRLF
fn canonicalize_header(name: &str, value: &str) -> String {
    let unfolded = value.replace("\r\n", "").replace('\n', "");
    format!(
        "{}:{}",
        name.trim().to_ascii_lowercase(),
        collapse_whitespace(&unfolded)
    )
}

// relaxed body canonicalization
fn canonicalize_body(body: &str) -> String {
    let mut lines: Vec<String> = body
        .split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let collapsed = line.replace('\t', " ");
            let mut out = String::with_capacity(collapsed.len());
            let mut last_space = false;
            for ch in collapsed.chars() {
                if ch == ' ' {
                    if !last_space {
                        out.push(' ');
                    }
                    last_space = true;
                } else {
                    out.push(ch);
                    last_space = false;
                }
            }
            out.trim_end_matches(' ').to_string()
        })
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut canonical = lines.join("\r\n");
    canonical.push_str("\r\n");
    canonical
}
