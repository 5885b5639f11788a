use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads a flat JSON object. Missing, unreadable or corrupt files load as empty.
pub fn load_map<T: DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state file yet");
            return HashMap::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable state file, starting empty");
            return HashMap::new();
        }
    };

    if content.trim().is_empty() {
        return HashMap::new();
    }

    match serde_json::from_str(&content) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state file, starting empty");
            HashMap::new()
        }
    }
}

/// Rewrites the whole file: write to a sibling temp file, then rename over.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn save_map<T: Serialize>(path: &Path, map: &HashMap<String, T>) -> Result<(), StoreError> {
    save_json(path, map)
}
