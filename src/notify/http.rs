//! HTTP Notifiers
//!
//! Generic webhook, Slack incoming webhook and Telegram bot adapters.

use std::time::Duration;

use serde_json::json;

use super::Notifier;

/// HTTP client shared by all adapters
static HTTP_CLIENT: std::sync::LazyLock<reqwest::Client> = std::sync::LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

async fn post_json(notifier: &str, url: &str, body: &serde_json::Value) -> bool {
    match HTTP_CLIENT.post(url).json(body).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            tracing::warn!(notifier, status = %resp.status(), "Notifier endpoint rejected message");
            false
        }
        Err(e) => {
            tracing::warn!(notifier, "Notifier request failed: {}", e);
            false
        }
    }
}

/// POSTs `{message, data}` as JSON to an arbitrary URL
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn is_configured(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    async fn send(&self, message: &str, data: &serde_json::Value) -> bool {
        if !self.is_configured() {
            return false;
        }
        let body = json!({ "message": message, "data": data });
        post_json(self.name(), &self.url, &body).await
    }
}

/// Slack incoming webhook
pub struct SlackNotifier {
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    async fn send(&self, message: &str, data: &serde_json::Value) -> bool {
        if !self.is_configured() {
            return false;
        }
        let event = data["event"].as_str().unwrap_or("wal");
        let body = json!({ "text": format!("[{}] {}", event, message) });
        post_json(self.name(), &self.webhook_url, &body).await
    }
}

/// Telegram bot `sendMessage`
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    /// Point at a different Bot API server
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        )
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    async fn send(&self, message: &str, data: &serde_json::Value) -> bool {
        if !self.is_configured() {
            return false;
        }
        let event = data["event"].as_str().unwrap_or("wal");
        let body = json!({
            "chat_id": self.chat_id,
            "text": format!("[{}] {}", event, message),
            "disable_notification": false,
        });
        post_json(self.name(), &self.endpoint(), &body).await
    }
}
