use clap::Parser;
use std::time::Duration;
use crate::sigv4::Credentials;
use crate::throttle::DEFAULT_THROTTLE_FACTOR;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_FROM_EMAIL: &str = "webmaster@localhost";
pub const DEFAULT_DKIM_SELECTOR: &str = "ses";
pub const DEFAULT_DKIM_HEADERS: [&str; 4] = ["From", "To", "Cc", "Subject"];

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "ses-gateway")]
#[command(about = "Email relay that sends through Amazon SES with client-side throttling")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // AWS credentials
    #[arg(long, env = "AWS_SES_ACCESS_KEY_ID")]
    pub access_key: Option<String>,

    #[arg(long, env = "AWS_SES_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    #[arg(long, env = "AWS_SES_REGION_NAME", default_value = DEFAULT_REGION)]
    pub region: String,

    // Full endpoint URL, e.g. "http://localhost:4566"
    #[arg(long, env = "AWS_SES_REGION_ENDPOINT")]
    pub endpoint: Option<String>,

    // Fraction of the SES max send rate to target, 0 disables throttling
    #[arg(long, env = "AWS_SES_AUTO_THROTTLE", default_value_t = DEFAULT_THROTTLE_FACTOR)]
    pub auto_throttle: f64,

    // Seconds before a cached SES rate limit is refetched (never when unset)
    #[arg(long, env = "AWS_SES_RATE_LIMIT_TTL")]
    pub rate_limit_ttl: Option<u64>,

    // Envelope sender for every message
    #[arg(long, env = "DEFAULT_FROM_EMAIL", default_value = DEFAULT_FROM_EMAIL)]
    pub from_email: String,

    #[arg(long, env = "DKIM_DOMAIN")]
    pub dkim_domain: Option<String>,

    // Base64 Ed25519 private key (32 byte seed)
    #[arg(long, env = "DKIM_PRIVATE_KEY", hide_env_values = true)]
    pub dkim_private_key: Option<String>,

    #[arg(long, env = "DKIM_SELECTOR", default_value = DEFAULT_DKIM_SELECTOR)]
    pub dkim_selector: String,

    // Headers to sign (comma-separated)
    #[arg(long, env = "DKIM_HEADERS", value_delimiter = ',', default_value = "From,To,Cc,Subject")]
    pub dkim_headers: Vec<String>,

    #[arg(long, env = "EMAIL_FAIL_SILENTLY")]
    pub fail_silently: bool,

    // SES request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    // Max batches waiting for the send worker
    #[arg(long, default_value_t = 100)]
    pub queue_size: usize,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn settings(&self) -> SesSettings {
        let credentials = match (&self.access_key, &self.secret_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: self.session_token.clone(),
            }),
            _ => None,
        };

        SesSettings {
            credentials,
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            auto_throttle: Some(self.auto_throttle),
            rate_limit_ttl: self.rate_limit_ttl.map(Duration::from_secs),
            default_from_email: self.from_email.clone(),
            dkim: DkimSettings {
                domain: self.dkim_domain.clone(),
                private_key: self.dkim_private_key.clone(),
                selector: self.dkim_selector.clone(),
                headers: self.dkim_headers.clone(),
            },
            fail_silently: self.fail_silently,
            request_timeout: Duration::from_secs(self.request_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkimSettings {
    pub domain: Option<String>,
    pub private_key: Option<String>,
    pub selector: String,
    pub headers: Vec<String>,
}

impl Default for DkimSettings {
    fn default() -> Self {
        Self {
            domain: None,
            private_key: None,
            selector: DEFAULT_DKIM_SELECTOR.to_string(),
            headers: DEFAULT_DKIM_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Everything the mail backend reads from configuration.
#[derive(Debug, Clone)]
pub struct SesSettings {
    pub credentials: Option<Credentials>,
    pub region: String,
    pub endpoint: Option<String>,
    /// `None` or a factor <= 0 disables throttling.
    pub auto_throttle: Option<f64>,
    pub rate_limit_ttl: Option<Duration>,
    pub default_from_email: String,
    pub dkim: DkimSettings,
    pub fail_silently: bool,
    pub request_timeout: Duration,
}

impl Default for SesSettings {
    fn default() -> Self {
        Self {
            credentials: None,
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            auto_throttle: Some(DEFAULT_THROTTLE_FACTOR),
            rate_limit_ttl: None,
            default_from_email: DEFAULT_FROM_EMAIL.to_string(),
            dkim: DkimSettings::default(),
            fail_silently: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SesSettings {
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://email.{}.amazonaws.com", self.region))
    }

    // Identity the cached rate limit is keyed by
    pub fn access_key_id(&self) -> &str {
        self.credentials
            .as_ref()
            .map(|c| c.access_key_id.as_str())
            .unwrap_or_default()
    }
}
