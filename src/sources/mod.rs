//! Island sources.
//!
//! Each source wraps one external listings provider and turns its records
//! into [`Island`]s. Sources are polled sequentially by the registry and
//! own their rate-limit state.

pub mod turnip_exchange;

use crate::island::Island;
use async_trait::async_trait;
use thiserror::Error;

pub use turnip_exchange::TurnipExchangeSource;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Provider asked us to back off. Treated as an empty result.
    #[error("try later: {0}")]
    Transient(String),
    #[error("source failed: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait IslandSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the provider's current listings. Returns an empty list without
    /// touching the network while rate limited.
    async fn run(&mut self) -> Result<Vec<Island>, SourceError>;
}

/// Rate-limit state extracted from the latest provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: i64,
    pub remaining: i64,
    /// Epoch seconds at which the quota resets.
    pub reset: i64,
    /// Earliest epoch second at which the next request should be sent.
    pub next: i64,
}

impl RateLimit {
    /// Spread the remaining quota evenly over the time left in the window.
    pub fn compute(limit: i64, remaining: i64, reset: i64, now: i64) -> Self {
        let next = if remaining > 0 {
            now.saturating_add(reset.saturating_sub(now) / remaining)
        } else {
            reset
        };

        Self {
            limit,
            remaining,
            reset,
            next,
        }
    }

    pub fn is_limited(&self, now: i64) -> bool {
        (self.remaining == 0 && now < self.reset) || now < self.next
    }
}
