use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::tracker::{save_json, StoreError};

/// Accepted values, in cycle order
pub const ALLOWED_LOG_LENGTHS: [u32; 4] = [100, 150, 200, 300];

#[derive(Error, Debug)]
pub enum LogLengthError {
    #[error("unsupported log length {0} (expected one of 100, 150, 200, 300)")]
    Unsupported(u32),

    #[error("not a number: {0}")]
    NotANumber(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct LogLength(u32);

impl LogLength {
    pub fn new(lines: u32) -> Result<Self, LogLengthError> {
        if ALLOWED_LOG_LENGTHS.contains(&lines) {
            Ok(Self(lines))
        } else {
            Err(LogLengthError::Unsupported(lines))
        }
    }

    pub fn lines(self) -> u32 {
        self.0
    }

    /// 100 → 150 → 200 → 300 → 100
    pub fn next(self) -> Self {
        let pos = ALLOWED_LOG_LENGTHS
            .iter()
            .position(|&l| l == self.0)
            .unwrap_or(0);
        Self(ALLOWED_LOG_LENGTHS[(pos + 1) % ALLOWED_LOG_LENGTHS.len()])
    }
}

impl Default for LogLength {
    fn default() -> Self {
        Self(ALLOWED_LOG_LENGTHS[0])
    }
}

impl TryFrom<u32> for LogLength {
    type Error = LogLengthError;

    fn try_from(lines: u32) -> Result<Self, Self::Error> {
        Self::new(lines)
    }
}

impl From<LogLength> for u32 {
    fn from(length: LogLength) -> u32 {
        length.0
    }
}

impl std::str::FromStr for LogLength {
    type Err = LogLengthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lines: u32 = s
            .trim()
            .parse()
            .map_err(|_| LogLengthError::NotANumber(s.to_string()))?;
        Self::new(lines)
    }
}

impl std::fmt::Display for LogLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLengthFile {
    lines: LogLength,
}

/// `{"lines": N}` on disk, shared by the daemon and the CLI
pub struct LogLengthStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LogLengthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current setting; the default when the file is missing or invalid.
    /// Read on every call so a change from the CLI applies without a restart.
    pub fn get(&self) -> LogLength {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return LogLength::default(),
        };
        match serde_json::from_str::<LogLengthFile>(&content) {
            Ok(file) => file.lines,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "invalid log length file, using default");
                LogLength::default()
            }
        }
    }

    pub fn set(&self, length: LogLength) -> Result<(), LogLengthError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        save_json(&self.path, &LogLengthFile { lines: length })?;
        info!(lines = length.lines(), "log length set");
        Ok(())
    }

    pub fn cycle(&self) -> Result<LogLength, LogLengthError> {
        let next = self.get().next();
        self.set(next)?;
        Ok(next)
    }

    pub fn reset(&self) -> Result<LogLength, LogLengthError> {
        let length = LogLength::default();
        self.set(length)?;
        Ok(length)
    }
}
