mod listeners;

pub use listeners::{ListenerPolicy, NotificationListener, TimeRecordingListener};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

use crate::detect::SessionState;

/// Events kept for diagnostics
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionKind {
    /// Detected working to idle, or a question on screen
    StateTransition { from: SessionState, to: SessionState },
    /// Reported by a push-style source
    Explicit,
    /// Busy hint stuck on an unchanged screen
    Timeout { unchanged_secs: u64 },
    /// A chat user said the session is done
    UserMarked { user_id: i64 },
}

impl CompletionKind {
    pub fn describe(&self) -> String {
        match self {
            CompletionKind::StateTransition {
                to: SessionState::WaitingForInput,
                ..
            } => "is waiting for input".to_string(),
            CompletionKind::StateTransition { .. } => "finished".to_string(),
            CompletionKind::Explicit => "reported completion".to_string(),
            CompletionKind::Timeout { unchanged_secs } => format!(
                "has shown no screen change for {}",
                crate::tracker::format_duration(*unchanged_secs as f64)
            ),
            CompletionKind::UserMarked { .. } => "was marked done".to_string(),
        }
    }

    pub fn needs_input(&self) -> bool {
        matches!(
            self,
            CompletionKind::StateTransition {
                to: SessionState::WaitingForInput,
                ..
            }
        )
    }
}

/// Immutable once emitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub session: String,
    pub kind: CompletionKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl CompletionEvent {
    pub fn new(session: impl Into<String>, kind: CompletionKind) -> Self {
        Self {
            session: session.into(),
            kind,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait CompletionListener: Send + Sync {
    /// Identifies the listener in logs
    fn name(&self) -> &str;

    async fn on_completion(&self, event: &CompletionEvent) -> anyhow::Result<()>;
}

pub struct CompletionEventBus {
    listeners: RwLock<Vec<Arc<dyn CompletionListener>>>,
    history: Mutex<VecDeque<CompletionEvent>>,
    history_limit: usize,
}

fn same_listener(a: &Arc<dyn CompletionListener>, b: &Arc<dyn CompletionListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl CompletionEventBus {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: limit.max(1),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn CompletionListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        debug!(listener = listener.name(), "listener subscribed");
        listeners.push(listener);
    }

    /// Returns false if the listener was not subscribed
    pub fn unsubscribe(&self, listener: &Arc<dyn CompletionListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub async fn emit(&self, event: CompletionEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            while history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Delivery works on a snapshot so subscribe/unsubscribe never races an emit
        let listeners: Vec<Arc<dyn CompletionListener>> = self
            .listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone());

        debug!(
            session = %event.session,
            kind = ?event.kind,
            listeners = listeners.len(),
            "emitting completion event"
        );

        for listener in listeners {
            match AssertUnwindSafe(listener.on_completion(&event))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        listener = listener.name(),
                        session = %event.session,
                        error = %format!("{:#}", e),
                        "completion listener failed"
                    );
                }
                Err(_) => {
                    error!(
                        listener = listener.name(),
                        session = %event.session,
                        "completion listener panicked"
                    );
                }
            }
        }
    }

    /// Up to `limit` most recent events, oldest first, optionally for one session
    pub fn get_recent_events(&self, session: Option<&str>, limit: usize) -> Vec<CompletionEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut events: Vec<CompletionEvent> = history
            .iter()
            .rev()
            .filter(|e| session.map_or(true, |s| e.session == s))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }
}

impl Default for CompletionEventBus {
    fn default() -> Self {
        Self::new()
    }
}
