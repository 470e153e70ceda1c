//! Direct-message delivery.
//!
//! The finder only needs "deliver this text to this user". Delivery that
//! fails is retried with exponential backoff up to a fixed number of
//! attempts; after that the caller logs and moves on.

use crate::config::NotifyConfig;
use crate::island::Island;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("send failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_direct(&self, user_id: &str, text: &str) -> Result<(), SendError>;
}

pub fn format_island_message(island: &Island) -> String {
    format!(
        "[{}/{}] {} \tPrice: {}\nURL: {}\nFee: {}\n{}\n",
        island.in_queue,
        island.max_queue,
        island.name,
        island.turnip_price,
        island.url,
        island.fee,
        island.description
    )
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotifyConfig::default())
    }
}

/// Send a message, retrying transport failures. Returns the last error
/// once every attempt has failed.
pub async fn send_with_retry(
    sender: &dyn MessageSender,
    policy: RetryPolicy,
    user_id: &str,
    text: &str,
) -> Result<(), SendError> {
    let mut attempt = 1;
    loop {
        match sender.send_direct(user_id, text).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    user = %user_id,
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "direct message failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
