//! Telegram Bot API channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use beacon_common::error::AppError;
use beacon_engine::ports::NotificationChannel;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

/// Envelope every Bot API response is wrapped in.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramChannel {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
}

impl TelegramChannel {
    pub fn new(
        api_url: impl Into<String>,
        bot_token: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), AppError> {
        let body = SendMessage {
            chat_id: channel_id,
            text,
            parse_mode: "HTML",
        };

        // The request URL carries the bot token; keep it out of error text
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Send(format!("sendMessage failed: {}", e.without_url())))?;

        let status = response.status();
        let api: Option<ApiResponse> = response.json().await.ok();

        match api {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Some(ApiResponse { description, .. }) => Err(AppError::Send(format!(
                "Telegram API returned {}: {}",
                status,
                description.unwrap_or_else(|| "no description".to_string())
            ))),
            None => Err(AppError::Send(format!(
                "Telegram API returned {} with an unreadable body",
                status
            ))),
        }
    }
}
