mod client;
mod scripted;

pub use client::TmuxClient;
pub use scripted::ScriptedAccessor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents a tmux session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmuxSession {
    /// Session ID (e.g., "$0")
    pub id: String,
    /// Session name
    pub name: String,
    /// Unix timestamp when session was created
    pub created_at: i64,
    /// Number of attached clients
    pub attached_clients: usize,
}

impl TmuxSession {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            created_at: 0,
            attached_clients: 0,
        }
    }
}

/// Keys understood by tmux `send-keys` without `-l`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    Enter,
    Escape,
    /// Ctrl-C
    Interrupt,
    /// Ctrl-U, erases the current input line
    EraseLine,
}

impl NamedKey {
    pub fn tmux_name(self) -> &'static str {
        match self {
            NamedKey::Enter => "Enter",
            NamedKey::Escape => "Escape",
            NamedKey::Interrupt => "C-c",
            NamedKey::EraseLine => "C-u",
        }
    }
}

/// Input forwarded into a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    /// Typed verbatim
    Literal(String),
    Named(NamedKey),
}

#[derive(Error, Debug)]
pub enum TmuxError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("tmux {op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("tmux {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },

    #[error("failed to execute tmux: {0}")]
    Io(#[from] std::io::Error),
}

impl TmuxError {
    /// Errors that only mean "no data this time"
    pub fn is_transient(&self) -> bool {
        matches!(self, TmuxError::Timeout { .. } | TmuxError::Command { .. })
    }
}

/// Read and write access to terminal sessions.
///
/// Everything above this trait talks to sessions only through it, so tests
/// can swap tmux for a scripted fake.
#[async_trait]
pub trait ScreenAccessor: Send + Sync {
    /// All sessions on the server; empty when no server is running.
    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError>;

    async fn exists(&self, session: &str) -> Result<bool, TmuxError>;

    /// Visible text of the session's active pane.
    async fn capture(&self, session: &str) -> Result<String, TmuxError>;

    async fn send_keys(&self, session: &str, keys: &Keys) -> Result<(), TmuxError>;

    /// Unix timestamp of session creation, if tmux knows it.
    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError>;
}
