use thiserror::Error;

use crate::config::ConfigError;
use crate::log_length::LogLengthError;
use crate::notify::DispatchError;
use crate::tmux::TmuxError;
use crate::tracker::StoreError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("tmux error: {0}")]
    Tmux(#[from] TmuxError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("chat delivery error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    LogLength(#[from] LogLengthError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short text safe to show a chat user; details stay in the log
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Tmux(TmuxError::NotFound(_)) => "Session not found.".to_string(),
            RelayError::LogLength(e @ LogLengthError::Unsupported(_)) => e.to_string(),
            RelayError::LogLength(e @ LogLengthError::NotANumber(_)) => e.to_string(),
            _ => "Something went wrong, see the relay log.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
