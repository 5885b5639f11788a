use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::store::{load_map, save_map, StoreError};
use super::{normalize_session_name, now_unix};
use crate::detect::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: SessionState,
    /// Unix timestamp of the transition into `state`
    pub since: f64,
}

/// Last known discrete state per session, persisted across restarts
pub struct SessionStateStore {
    path: PathBuf,
    records: Mutex<HashMap<String, StateRecord>>,
}

impl SessionStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_map(&path);
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StateRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores the state if it differs from the last one. Returns whether it changed.
    pub fn record(&self, session: &str, state: SessionState) -> Result<bool, StoreError> {
        let mut records = self.lock();
        if records.get(session).map(|r| r.state) == Some(state) {
            return Ok(false);
        }

        debug!(session, state = state.label(), "session state changed");
        records.insert(
            session.to_string(),
            StateRecord {
                state,
                since: now_unix(),
            },
        );
        save_map(&self.path, &records)?;
        Ok(true)
    }

    /// Exact name first, then the most recent record with the same base name
    pub fn get(&self, session: &str) -> Option<StateRecord> {
        let records = self.lock();
        if let Some(record) = records.get(session) {
            return Some(*record);
        }

        let base = normalize_session_name(session);
        records
            .iter()
            .filter(|(k, _)| normalize_session_name(k) == base)
            .map(|(_, r)| *r)
            .max_by(|a, b| a.since.total_cmp(&b.since))
    }

    pub fn forget(&self, session: &str) -> Result<(), StoreError> {
        let mut records = self.lock();
        if records.remove(session).is_some() {
            save_map(&self.path, &records)?;
        }
        Ok(())
    }

    pub fn all(&self) -> HashMap<String, StateRecord> {
        self.lock().clone()
    }
}
