//! Amazon SES mail backend with adaptive client-side throttling.
//!
//! [`SesBackend`] sends batches of [`EmailMessage`]s through SES, pacing
//! itself against the account's max send rate, optionally DKIM signing each
//! message and recording SES results on the message metadata.

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod dkim;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod ses;
pub mod sigv4;
pub mod state;
pub mod throttle;
pub mod worker;

pub use backend::SesBackend;
pub use client::{SesClient, SesConnector};
pub use config::{Args, DkimSettings, SesSettings};
pub use dkim::{DkimSigner, MessageSigner, NoopSigner};
pub use error::{ClientError, MailError};
pub use models::EmailMessage;
pub use ses::HttpSesConnector;
pub use state::ThrottleState;
pub use throttle::ThrottleController;
