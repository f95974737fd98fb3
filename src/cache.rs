use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

// Cache entry with timestamp
#[derive(Clone, Copy, Debug)]
pub struct CacheEntry {
    pub rate_limit: f64,
    pub fetched_at: Instant,
}

// Create a cache key (hash of the access key id)
pub fn make_cache_key(access_key_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_key_id);
    format!("{:x}", hasher.finalize())
}

/// Max-send-rate per credential identity, as last reported by SES.
///
/// Without a TTL an entry lives for the life of the process.
#[derive(Debug, Default)]
pub struct RateLimitCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Option<Duration>,
}

impl RateLimitCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        let entry = *self.entries.get(key)?;
        match self.ttl {
            Some(ttl) if entry.fetched_at.elapsed() >= ttl => {
                self.entries.remove(key);
                None
            }
            _ => Some(entry.rate_limit),
        }
    }

    pub fn insert(&self, key: &str, rate_limit: f64) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                rate_limit,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
