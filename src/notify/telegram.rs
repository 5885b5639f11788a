use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{split_message, DispatchError, MessageFormat, NotificationDispatcher, MESSAGE_LIMIT};

/// Plain requests; getUpdates adds its long-poll timeout on top
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

pub struct TelegramClient {
    http: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, DispatchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, DispatchError> {
        let response = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let parsed: ApiResponse<T> = response.json().await?;
        if !parsed.ok {
            return Err(DispatchError::Api {
                method,
                description: parsed
                    .description
                    .unwrap_or_else(|| format!("status {}", status.as_u16())),
            });
        }
        parsed.result.ok_or(DispatchError::EmptyResult(method))
    }

    /// Sends one message, which must already fit the length limit
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
    ) -> Result<Message, DispatchError> {
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: match format {
                MessageFormat::Html => Some("HTML"),
                MessageFormat::Plain => None,
            },
        };
        self.call(
            "sendMessage",
            &body,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
        .await
    }

    /// Long-polls for updates after `offset`, waiting up to `timeout`
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>, DispatchError> {
        let body = GetUpdates {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: ["message"],
        };
        self.call(
            "getUpdates",
            &body,
            timeout + Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
        .await
    }
}

#[async_trait]
impl NotificationDispatcher for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str, format: MessageFormat) -> bool {
        let fragments = split_message(text, MESSAGE_LIMIT);
        let total = fragments.len();
        for (i, fragment) in fragments.iter().enumerate() {
            if let Err(e) = self.send_message(chat_id, fragment, format).await {
                warn!(chat_id, fragment = i + 1, total, error = %e, "failed to send message");
                return false;
            }
        }
        debug!(chat_id, fragments = total, "message sent");
        true
    }
}
