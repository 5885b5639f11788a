mod split;
mod telegram;

pub use split::{split_message, MESSAGE_LIMIT};
pub use telegram::{Chat, Message, TelegramClient, Update, User};

use async_trait::async_trait;
use thiserror::Error;

use crate::events::CompletionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Plain,
    /// Telegram's HTML subset: b, i, code, pre
    Html,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat API rejected {method}: {description}")]
    Api { method: &'static str, description: String },

    #[error("chat API returned no result for {0}")]
    EmptyResult(&'static str),
}

/// Delivers text to a chat. Returns false when delivery failed; the cause is
/// logged by the implementation.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, format: MessageFormat) -> bool;
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// HTML notice for a completion, optionally followed by the screen tail
pub fn format_completion_notice(event: &CompletionEvent, tail: Option<&str>) -> String {
    let icon = if event.kind.needs_input() { "❓" } else { "✅" };
    let mut text = format!(
        "{} <b>{}</b> {}",
        icon,
        escape_html(&event.session),
        event.kind.describe()
    );
    if let Some(tail) = tail {
        text.push_str("\n<pre>");
        text.push_str(&escape_html(tail));
        text.push_str("</pre>");
    }
    text
}
