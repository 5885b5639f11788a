mod commands;

pub use commands::{Command, HELP};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detect::{is_waiting_for_input, is_working_simple, trailing_lines, SessionState};
use crate::error::Result;
use crate::events::{CompletionEvent, CompletionKind};
use crate::log_length::{LogLength, LogLengthStore};
use crate::monitor::Scheduler;
use crate::notify::{escape_html, MessageFormat, NotificationDispatcher, TelegramClient};
use crate::tmux::{Keys, NamedKey, TmuxError};
use crate::tracker::WaitTimeTracker;

pub const NOT_AUTHORIZED: &str = "⛔ Not authorized.";
const NO_TARGET: &str = "No target session. Pick one with /use &lt;session&gt;.";
const SEND_FAILED: &str = "Failed to send keys.";
const TOP_PATTERNS: usize = 10;

/// Wait between getUpdates retries after an error
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct ChatController {
    scheduler: Arc<Scheduler>,
    tracker: Arc<WaitTimeTracker>,
    log_length: Arc<LogLengthStore>,
    allowed_users: HashSet<i64>,
    target: Mutex<Option<String>>,
}

impl ChatController {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tracker: Arc<WaitTimeTracker>,
        log_length: Arc<LogLengthStore>,
        allowed_users: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            scheduler,
            tracker,
            log_length,
            allowed_users: allowed_users.into_iter().collect(),
            target: Mutex::new(None),
        }
    }

    pub fn is_authorized(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }

    pub fn target(&self) -> Option<String> {
        self.target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reply to one message, as HTML
    pub async fn handle(&self, user_id: i64, text: &str) -> String {
        if !self.is_authorized(user_id) {
            warn!(user_id, "unauthorized chat user");
            return NOT_AUTHORIZED.to_string();
        }

        let command = Command::parse(text);
        debug!(user_id, command = ?command, "chat command");
        match self.execute(command, user_id).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(user_id, error = %e, "chat command failed");
                e.user_message()
            }
        }
    }

    pub async fn execute(&self, command: Command, user_id: i64) -> Result<String> {
        match command {
            Command::Status => self.status().await,
            Command::Screen(session) => self.screen(session).await,
            Command::Use(Some(session)) => self.use_session(session).await,
            Command::Use(None) => Ok("Usage: /use &lt;session&gt;".to_string()),
            Command::Text(text) => self.type_text(&text).await,
            Command::Key(key) => self.press(key).await,
            Command::Done(session) => self.mark_done(session, user_id).await,
            Command::LogLength(value) => self.log_length(value),
            Command::Patterns => Ok(self.patterns()),
            Command::Help => Ok(HELP.to_string()),
            Command::Unknown(name) => Ok(format!(
                "Unknown command /{}. Send /help for the list.",
                escape_html(&name)
            )),
        }
    }

    fn command_timeout(&self) -> Duration {
        self.scheduler.context().settings.command_timeout
    }

    async fn capture(&self, session: &str) -> Result<String> {
        let ctx = self.scheduler.context();
        match tokio::time::timeout(self.command_timeout(), ctx.accessor.capture(session)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TmuxError::Timeout {
                op: "capture-pane",
                secs: self.command_timeout().as_secs(),
            }
            .into()),
        }
    }

    /// Explicit argument, else the chosen target, else the only monitored session
    fn resolve(&self, session: Option<String>) -> Option<String> {
        session.or_else(|| self.target()).or_else(|| {
            let monitored = self.scheduler.monitored_sessions();
            (monitored.len() == 1).then(|| monitored[0].clone())
        })
    }

    async fn status(&self) -> Result<String> {
        let sessions = self.scheduler.monitored_sessions();
        if sessions.is_empty() {
            return Ok("No sessions monitored.".to_string());
        }

        let target = self.target();
        let states = self.scheduler.context().states.clone();
        let mut lines = vec!["<b>Sessions</b>".to_string()];
        for session in sessions {
            let state = match self.capture(&session).await {
                Ok(snapshot) => SessionState::classify(
                    is_working_simple(&snapshot),
                    is_waiting_for_input(&snapshot),
                ),
                Err(e) => {
                    debug!(session = %session, error = %e, "status capture failed");
                    states
                        .as_ref()
                        .and_then(|s| s.get(&session))
                        .map_or(SessionState::Unknown, |r| r.state)
                }
            };

            let mut line = format!("• <b>{}</b>: {}", escape_html(&session), state.label());
            if state != SessionState::Working {
                let wait = self.tracker.get_wait_time_since_completion(&session).await;
                line.push_str(&format!(", waiting {}", wait.describe()));
            }
            if target.as_deref() == Some(session.as_str()) {
                line.push_str(" ◀");
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    async fn screen(&self, session: Option<String>) -> Result<String> {
        let Some(session) = self.resolve(session) else {
            return Ok(NO_TARGET.to_string());
        };
        let snapshot = self.capture(&session).await?;
        let lines = self.log_length.get().lines() as usize;
        let tail = trailing_lines(&snapshot, lines).join("\n");
        if tail.trim().is_empty() {
            return Ok(format!("<b>{}</b>: (empty screen)", escape_html(&session)));
        }
        Ok(format!(
            "<b>{}</b>\n<pre>{}</pre>",
            escape_html(&session),
            escape_html(&tail)
        ))
    }

    async fn use_session(&self, session: String) -> Result<String> {
        let accessor = &self.scheduler.context().accessor;
        let exists = match tokio::time::timeout(self.command_timeout(), accessor.exists(&session)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TmuxError::Timeout {
                    op: "has-session",
                    secs: self.command_timeout().as_secs(),
                }
                .into())
            }
        };
        if !exists {
            return Err(TmuxError::NotFound(session).into());
        }

        self.scheduler.ensure_monitoring(&session);
        let reply = format!("Target set to <b>{}</b>.", escape_html(&session));
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        Ok(reply)
    }

    async fn send(&self, session: &str, keys: &[Keys]) -> std::result::Result<(), String> {
        let accessor = &self.scheduler.context().accessor;
        for key in keys {
            let sent = tokio::time::timeout(self.command_timeout(), accessor.send_keys(session, key)).await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(TmuxError::NotFound(_))) => return Err("Session not found.".to_string()),
                Ok(Err(e)) => {
                    error!(session, error = %e, "send-keys failed");
                    return Err(SEND_FAILED.to_string());
                }
                Err(_) => {
                    error!(session, "send-keys timed out");
                    return Err(SEND_FAILED.to_string());
                }
            }
        }
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<String> {
        let Some(session) = self.resolve(None) else {
            return Ok(NO_TARGET.to_string());
        };
        let keys = [Keys::Literal(text.to_string()), Keys::Named(NamedKey::Enter)];
        Ok(match self.send(&session, &keys).await {
            Ok(()) => format!("Sent to <b>{}</b>.", escape_html(&session)),
            Err(reply) => reply,
        })
    }

    async fn press(&self, key: NamedKey) -> Result<String> {
        let Some(session) = self.resolve(None) else {
            return Ok(NO_TARGET.to_string());
        };
        Ok(match self.send(&session, &[Keys::Named(key)]).await {
            Ok(()) => format!("Sent {} to <b>{}</b>.", key.tmux_name(), escape_html(&session)),
            Err(reply) => reply,
        })
    }

    async fn mark_done(&self, session: Option<String>, user_id: i64) -> Result<String> {
        let Some(session) = self.resolve(session) else {
            return Ok(NO_TARGET.to_string());
        };
        let event = CompletionEvent::new(session.clone(), CompletionKind::UserMarked { user_id })
            .with_metadata("source", "chat");
        self.scheduler.context().bus.emit(event).await;
        info!(session = %session, user_id, "session marked done");
        Ok(format!("Marked <b>{}</b> as done.", escape_html(&session)))
    }

    fn log_length(&self, value: Option<String>) -> Result<String> {
        match value {
            None => Ok(format!("Log length: {} lines.", self.log_length.get())),
            Some(value) => {
                let length: LogLength = value.parse()?;
                self.log_length.set(length)?;
                Ok(format!("Log length set to {} lines.", length))
            }
        }
    }

    fn patterns(&self) -> String {
        let frequencies = self.scheduler.context().detector.pattern_frequencies();
        if frequencies.is_empty() {
            return "No missed cases recorded.".to_string();
        }
        let mut lines = vec!["<b>Patterns seen while reported idle</b>".to_string()];
        for (label, tier, count) in frequencies.into_iter().take(TOP_PATTERNS) {
            lines.push(format!("{} ({:?}): {}", escape_html(&label), tier, count));
        }
        lines.join("\n")
    }
}

/// Long-polls the chat API and answers each message until cancelled
pub async fn run_bot(
    client: Arc<TelegramClient>,
    controller: Arc<ChatController>,
    poll_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut offset = 0;
    info!("chat polling started");

    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.get_updates(offset, poll_timeout) => result,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let (Some(from), Some(text)) = (message.from, message.text) else {
                continue;
            };

            let reply = controller.handle(from.id, &text).await;
            if !client.send(message.chat.id, &reply, MessageFormat::Html).await {
                warn!(chat_id = message.chat.id, "failed to deliver reply");
            }
        }
    }

    info!("chat polling stopped");
}
