use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("ses_send_requests_total", "Total number of send requests").unwrap();
    pub static ref EMAILS_SENT: Counter =
        register_counter!("ses_emails_sent_total", "Total emails accepted by SES").unwrap();
    pub static ref EMAILS_FAILED: Counter =
        register_counter!("ses_emails_failed_total", "Total emails rejected by SES").unwrap();
    pub static ref THROTTLE_DELAYS: Counter =
        register_counter!("ses_throttle_delays_total", "Total sends delayed by the throttle").unwrap();
    pub static ref THROTTLE_DELAY_SECONDS: Histogram = register_histogram!(
        "ses_throttle_delay_seconds",
        "Time spent waiting in the throttle"
    )
    .unwrap();
    pub static ref SEND_LATENCY: Histogram = register_histogram!(
        "ses_send_latency_seconds",
        "Batch send latency in seconds"
    )
    .unwrap();
    pub static ref MAX_SEND_RATE: Gauge =
        register_gauge!("ses_max_send_rate", "Last max send rate reported by SES").unwrap();
}
