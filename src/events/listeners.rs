use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{CompletionEvent, CompletionListener};
use crate::detect::trailing_lines;
use crate::log_length::LogLengthStore;
use crate::notify::{format_completion_notice, MessageFormat, NotificationDispatcher};
use crate::tmux::ScreenAccessor;
use crate::tracker::{normalize_session_name, WaitTimeTracker};

/// Duplicate and cooldown windows for the standard listeners
#[derive(Debug, Clone)]
pub struct ListenerPolicy {
    /// Same-session events closer than this are recorded once
    pub dedup_window: Duration,
    /// Minimum gap between notifications for one session
    pub notify_cooldown: Duration,
}

impl Default for ListenerPolicy {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            notify_cooldown: Duration::from_secs(30),
        }
    }
}

/// Claims `key` for now unless it was claimed less than `window` ago.
/// Check and insert happen under one lock; the previous stamp is returned
/// so a failed delivery can hand the slot back.
fn reserve(
    stamps: &Mutex<HashMap<String, Instant>>,
    key: &str,
    window: Duration,
) -> Option<Option<Instant>> {
    let mut stamps = stamps.lock().unwrap_or_else(|e| e.into_inner());
    let previous = stamps.get(key).copied();
    if previous.is_some_and(|at| at.elapsed() < window) {
        return None;
    }
    stamps.insert(key.to_string(), Instant::now());
    Some(previous)
}

fn release(stamps: &Mutex<HashMap<String, Instant>>, key: &str, previous: Option<Instant>) {
    let mut stamps = stamps.lock().unwrap_or_else(|e| e.into_inner());
    match previous {
        Some(at) => stamps.insert(key.to_string(), at),
        None => stamps.remove(key),
    };
}

/// Writes the completion time into the tracker
pub struct TimeRecordingListener {
    tracker: Arc<WaitTimeTracker>,
    dedup_window: Duration,
    last_recorded: Mutex<HashMap<String, Instant>>,
}

impl TimeRecordingListener {
    pub fn new(tracker: Arc<WaitTimeTracker>, dedup_window: Duration) -> Self {
        Self {
            tracker,
            dedup_window,
            last_recorded: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CompletionListener for TimeRecordingListener {
    fn name(&self) -> &str {
        "time-recording"
    }

    async fn on_completion(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        let key = normalize_session_name(&event.session);
        let Some(previous) = reserve(&self.last_recorded, key, self.dedup_window) else {
            debug!(session = %event.session, "duplicate completion within dedup window");
            return Ok(());
        };

        if let Err(e) = self.tracker.mark_completion_safe(&event.session) {
            release(&self.last_recorded, key, previous);
            return Err(e).with_context(|| format!("recording completion for {}", event.session));
        }
        Ok(())
    }
}

/// Sends a chat message per completion, at most once per cooldown window
pub struct NotificationListener {
    dispatcher: Arc<dyn NotificationDispatcher>,
    chat_id: i64,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
    screen: Option<ScreenTail>,
}

/// Where the screen excerpt in a notice comes from
struct ScreenTail {
    accessor: Arc<dyn ScreenAccessor>,
    log_length: Arc<LogLengthStore>,
    timeout: Duration,
}

impl NotificationListener {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>, chat_id: i64, cooldown: Duration) -> Self {
        Self {
            dispatcher,
            chat_id,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
            screen: None,
        }
    }

    /// Attach the last screen lines (per the log length setting) to each notice
    pub fn with_screen_tail(
        mut self,
        accessor: Arc<dyn ScreenAccessor>,
        log_length: Arc<LogLengthStore>,
        timeout: Duration,
    ) -> Self {
        self.screen = Some(ScreenTail {
            accessor,
            log_length,
            timeout,
        });
        self
    }

    async fn screen_tail(&self, session: &str) -> Option<String> {
        let screen = self.screen.as_ref()?;
        let lines = screen.log_length.get().lines() as usize;
        match tokio::time::timeout(screen.timeout, screen.accessor.capture(session)).await {
            Ok(Ok(snapshot)) => {
                let tail = trailing_lines(&snapshot, lines).join("\n");
                (!tail.trim().is_empty()).then_some(tail)
            }
            Ok(Err(e)) => {
                debug!(session, error = %e, "no screen for notification");
                None
            }
            Err(_) => {
                debug!(session, "screen capture for notification timed out");
                None
            }
        }
    }
}

#[async_trait]
impl CompletionListener for NotificationListener {
    fn name(&self) -> &str {
        "notification"
    }

    async fn on_completion(&self, event: &CompletionEvent) -> anyhow::Result<()> {
        let key = normalize_session_name(&event.session);
        let Some(previous) = reserve(&self.last_sent, key, self.cooldown) else {
            debug!(session = %event.session, "notification suppressed by cooldown");
            return Ok(());
        };

        let tail = self.screen_tail(&event.session).await;
        let text = format_completion_notice(event, tail.as_deref());

        if !self
            .dispatcher
            .send(self.chat_id, &text, MessageFormat::Html)
            .await
        {
            // give the slot back so the next event retries
            release(&self.last_sent, key, previous);
            return Err(anyhow!("notification for {} was not delivered", event.session));
        }

        info!(session = %event.session, kind = ?event.kind, "completion notification sent");
        Ok(())
    }
}
