//! Discord transport.
//!
//! - [`DiscordSender`] delivers direct messages over the REST API.
//! - [`gateway`] keeps a gateway session open and forwards every message
//!   created by another user as a [`ChatEvent`].

pub mod gateway;

use crate::notify::{MessageSender, SendError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use gateway::{start_gateway, ChatEvent, GatewayError};

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: String,
}

/// Sends direct messages through the Discord REST API, caching the DM
/// channel opened for each user.
#[derive(Clone)]
pub struct DiscordSender {
    client: reqwest::Client,
    api_url: String,
    token: String,
    dm_channels: Arc<DashMap<String, String>>,
}

impl DiscordSender {
    pub fn new(api_url: String, token: String) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            dm_channels: Arc::new(DashMap::new()),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, SendError> {
        let url = format!("{}{}", self.api_url, path);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn dm_channel(&self, user_id: &str) -> Result<String, SendError> {
        if let Some(id) = self.dm_channels.get(user_id) {
            return Ok(id.value().clone());
        }

        let resp = self
            .post_json("/users/@me/channels", json!({ "recipient_id": user_id }))
            .await?;
        let channel: DmChannel = resp.json().await?;

        debug!(user = %user_id, channel = %channel.id, "opened DM channel");
        self.dm_channels
            .insert(user_id.to_string(), channel.id.clone());
        Ok(channel.id)
    }
}

#[async_trait]
impl MessageSender for DiscordSender {
    async fn send_direct(&self, user_id: &str, text: &str) -> Result<(), SendError> {
        let channel_id = self.dm_channel(user_id).await?;
        self.post_json(
            &format!("/channels/{}/messages", channel_id),
            json!({ "content": text }),
        )
        .await?;
        Ok(())
    }
}
