use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{Keys, ScreenAccessor, TmuxError, TmuxSession};

#[derive(Debug, Default)]
struct ScriptedSession {
    created_at: Option<i64>,
    /// Screens returned by upcoming captures, front first
    queued: VecDeque<String>,
    /// Returned once the queue is drained
    current: String,
    failures: usize,
    hang: bool,
    hang_exists: bool,
}

#[derive(Debug, Default)]
struct ScriptedState {
    sessions: BTreeMap<String, ScriptedSession>,
    sent: Vec<(String, Keys)>,
    list_failures: usize,
}

/// In-memory test double for tmux with scripted screens
#[derive(Debug, Default)]
pub struct ScriptedAccessor {
    state: Mutex<ScriptedState>,
}

impl ScriptedAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, name: &str, screen: &str) {
        let mut state = self.lock();
        let session = state.sessions.entry(name.to_string()).or_default();
        session.current = screen.to_string();
    }

    pub fn add_session_created(&self, name: &str, created_at: i64) {
        let mut state = self.lock();
        state.sessions.entry(name.to_string()).or_default().created_at = Some(created_at);
    }

    pub fn remove_session(&self, name: &str) {
        self.lock().sessions.remove(name);
    }

    /// Replaces the screen shown from now on
    pub fn set_screen(&self, name: &str, screen: &str) {
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.queued.clear();
            session.current = screen.to_string();
        }
    }

    /// Screens for the next captures, one per capture. The last one sticks.
    pub fn queue_screens(&self, name: &str, screens: &[&str]) {
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session
                .queued
                .extend(screens.iter().map(|s| s.to_string()));
        }
    }

    /// The next `n` captures fail with a command error
    pub fn fail_captures(&self, name: &str, n: usize) {
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.failures = n;
        }
    }

    /// Captures never complete while set
    pub fn hang_captures(&self, name: &str, hang: bool) {
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.hang = hang;
        }
    }

    /// Existence checks never complete while set
    pub fn hang_existence_checks(&self, name: &str, hang: bool) {
        if let Some(session) = self.lock().sessions.get_mut(name) {
            session.hang_exists = hang;
        }
    }

    /// Whole list-sessions calls that fail next
    pub fn fail_listing(&self, n: usize) {
        self.lock().list_failures = n;
    }

    pub fn sent_keys(&self) -> Vec<(String, Keys)> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl ScreenAccessor for ScriptedAccessor {
    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError> {
        let mut state = self.lock();
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(TmuxError::Command {
                op: "list-sessions",
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(state
            .sessions
            .iter()
            .enumerate()
            .map(|(i, (name, s))| TmuxSession {
                id: format!("${}", i),
                name: name.clone(),
                created_at: s.created_at.unwrap_or(0),
                attached_clients: 0,
            })
            .collect())
    }

    async fn exists(&self, session: &str) -> Result<bool, TmuxError> {
        let hang = match self.lock().sessions.get(session) {
            Some(s) => s.hang_exists,
            None => return Ok(false),
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(true)
    }

    async fn capture(&self, session: &str) -> Result<String, TmuxError> {
        {
            let mut state = self.lock();
            let entry = state
                .sessions
                .get_mut(session)
                .ok_or_else(|| TmuxError::NotFound(session.to_string()))?;
            if entry.failures > 0 {
                entry.failures -= 1;
                return Err(TmuxError::Command {
                    op: "capture-pane",
                    stderr: "scripted failure".to_string(),
                });
            }
            if !entry.hang {
                if let Some(next) = entry.queued.pop_front() {
                    entry.current = next;
                }
                return Ok(entry.current.clone());
            }
        }

        std::future::pending().await
    }

    async fn send_keys(&self, session: &str, keys: &Keys) -> Result<(), TmuxError> {
        let mut state = self.lock();
        if !state.sessions.contains_key(session) {
            return Err(TmuxError::NotFound(session.to_string()));
        }
        state.sent.push((session.to_string(), keys.clone()));
        Ok(())
    }

    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError> {
        self.lock()
            .sessions
            .get(session)
            .map(|s| s.created_at)
            .ok_or_else(|| TmuxError::NotFound(session.to_string()))
    }
}
