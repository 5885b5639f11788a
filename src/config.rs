//! Environment configuration, read once at startup.
//!
//! | Variable | Required | Default |
//! |----------|----------|---------|
//! | `RELAY_BOT_TOKEN` | Yes | - |
//! | `RELAY_CHAT_ID` | Yes | - |
//! | `RELAY_ALLOWED_USERS` | Yes | - (comma-separated user ids) |
//! | `RELAY_POLL_INTERVAL_SECS` | No | 3 |
//! | `RELAY_LOG_LEVEL` | No | info |
//! | `RELAY_SESSION_PREFIX` | No | claude |
//! | `RELAY_STATE_DIR` | No | `~/.agent-relay` |
//! | `RELAY_API_BASE` | No | `https://api.telegram.org` |
//! | `RELAY_NOTIFY_COOLDOWN_SECS` | No | 30 |
//! | `RELAY_DEDUP_WINDOW_SECS` | No | 5 |
//! | `RELAY_STALE_HOURS` | No | 24 |
//! | `RELAY_FALLBACK_FACTOR` | No | 0.8 |
//! | `RELAY_STALL_TIMEOUT_SECS` | No | 300, 0 disables |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::events::ListenerPolicy;
use crate::monitor::MonitorSettings;
use crate::tracker::TrackerPolicy;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SESSION_PREFIX: &str = "claude";
const DEFAULT_STATE_DIR: &str = ".agent-relay";
const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;

pub const TIMES_FILE: &str = "times.json";
pub const SESSION_STATES_FILE: &str = "session_states.json";
pub const LOG_LENGTH_FILE: &str = "log_length.json";

const REQUIRED: [&str; 3] = ["RELAY_BOT_TOKEN", "RELAY_CHAT_ID", "RELAY_ALLOWED_USERS"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    /// Chat that receives completion notices
    pub chat_id: i64,
    pub allowed_users: Vec<i64>,
    pub poll_interval: Duration,
    /// tracing filter directive
    pub log_level: String,
    pub session_prefix: String,
    pub state_dir: PathBuf,
    pub api_base: String,
    pub stale_hours: u64,
    pub tracker: TrackerPolicy,
    pub listeners: ListenerPolicy,
    /// None disables timeout-based completion
    pub stall_timeout: Option<Duration>,
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str, expected: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected {expected}, got '{raw}'")))
}

pub fn default_state_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_STATE_DIR))
        .ok_or(ConfigError::NoHomeDirectory)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = REQUIRED
            .iter()
            .filter(|key| get(**key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let bot_token = get("RELAY_BOT_TOKEN").unwrap_or_default().trim().to_string();
        let chat_id = parse_value(
            "RELAY_CHAT_ID",
            &get("RELAY_CHAT_ID").unwrap_or_default(),
            "integer chat id",
        )?;

        let allowed_users = get("RELAY_ALLOWED_USERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| parse_value("RELAY_ALLOWED_USERS", s, "comma-separated user ids"))
            .collect::<Result<Vec<i64>, _>>()?;
        if allowed_users.is_empty() {
            return Err(invalid("RELAY_ALLOWED_USERS", "at least one user id is required"));
        }

        let poll_secs = match get("RELAY_POLL_INTERVAL_SECS") {
            Some(val) => parse_value("RELAY_POLL_INTERVAL_SECS", &val, "positive integer")?,
            None => DEFAULT_POLL_INTERVAL_SECS,
        };
        if poll_secs == 0 {
            return Err(invalid("RELAY_POLL_INTERVAL_SECS", "interval must be at least 1 second"));
        }

        let state_dir = match get("RELAY_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir()?,
        };

        let mut tracker = TrackerPolicy::default();
        let stale_hours = match get("RELAY_STALE_HOURS") {
            Some(val) => parse_value("RELAY_STALE_HOURS", &val, "positive integer")?,
            None => tracker.stale_after.as_secs() / 3600,
        };
        if stale_hours == 0 {
            return Err(invalid("RELAY_STALE_HOURS", "must be at least 1 hour"));
        }
        let stale_secs = stale_hours
            .checked_mul(3600)
            .ok_or_else(|| invalid("RELAY_STALE_HOURS", format!("{stale_hours} hours is too large")))?;
        tracker.stale_after = Duration::from_secs(stale_secs);

        if let Some(val) = get("RELAY_FALLBACK_FACTOR") {
            let factor: f64 = parse_value("RELAY_FALLBACK_FACTOR", &val, "number in (0, 1]")?;
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(invalid("RELAY_FALLBACK_FACTOR", format!("must be in (0, 1], got {factor}")));
            }
            tracker.fallback_factor = factor;
        }

        let mut listeners = ListenerPolicy::default();
        if let Some(val) = get("RELAY_NOTIFY_COOLDOWN_SECS") {
            let secs: u64 = parse_value("RELAY_NOTIFY_COOLDOWN_SECS", &val, "integer seconds")?;
            listeners.notify_cooldown = Duration::from_secs(secs);
        }
        if let Some(val) = get("RELAY_DEDUP_WINDOW_SECS") {
            let secs: u64 = parse_value("RELAY_DEDUP_WINDOW_SECS", &val, "integer seconds")?;
            listeners.dedup_window = Duration::from_secs(secs);
        }

        let stall_secs = match get("RELAY_STALL_TIMEOUT_SECS") {
            Some(val) => parse_value("RELAY_STALL_TIMEOUT_SECS", &val, "integer seconds")?,
            None => DEFAULT_STALL_TIMEOUT_SECS,
        };

        Ok(Self {
            bot_token,
            chat_id,
            allowed_users,
            poll_interval: Duration::from_secs(poll_secs),
            log_level: get("RELAY_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            session_prefix: get("RELAY_SESSION_PREFIX")
                .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_string()),
            state_dir,
            api_base: get("RELAY_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            stale_hours,
            tracker,
            listeners,
            stall_timeout: (stall_secs > 0).then(|| Duration::from_secs(stall_secs)),
        })
    }

    pub fn times_path(&self) -> PathBuf {
        self.state_dir.join(TIMES_FILE)
    }

    pub fn session_states_path(&self) -> PathBuf {
        self.state_dir.join(SESSION_STATES_FILE)
    }

    pub fn log_length_path(&self) -> PathBuf {
        self.state_dir.join(LOG_LENGTH_FILE)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            tick_interval: self.poll_interval,
            stall_timeout: self.stall_timeout,
            session_prefix: self.session_prefix.clone(),
            ..MonitorSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const MINIMAL: [(&str, &str); 4] = [
        ("RELAY_BOT_TOKEN", "123:abc"),
        ("RELAY_CHAT_ID", "-100200"),
        ("RELAY_ALLOWED_USERS", "11, 22"),
        ("RELAY_STATE_DIR", "/tmp/relay-state"),
    ];

    #[test]
    fn test_missing_keys_listed_together() {
        let err = Config::from_lookup(lookup(&[("RELAY_CHAT_ID", "1")])).unwrap_err();
        match err {
            ConfigError::Missing(keys) => {
                assert_eq!(keys, vec!["RELAY_BOT_TOKEN", "RELAY_ALLOWED_USERS"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let err = Config::from_lookup(lookup(&[
            ("RELAY_BOT_TOKEN", "  "),
            ("RELAY_CHAT_ID", "1"),
            ("RELAY_ALLOWED_USERS", "1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RELAY_BOT_TOKEN"));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_lookup(lookup(&MINIMAL)).unwrap();
        assert_eq!(config.chat_id, -100200);
        assert_eq!(config.allowed_users, vec![11, 22]);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.session_prefix, "claude");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.stale_hours, 24);
        assert_eq!(config.listeners.notify_cooldown, Duration::from_secs(30));
        assert_eq!(config.listeners.dedup_window, Duration::from_secs(5));
        assert_eq!(config.tracker.fallback_factor, 0.8);
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.times_path(), PathBuf::from("/tmp/relay-state/times.json"));
    }

    #[test]
    fn test_huge_stale_hours_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RELAY_STALE_HOURS", "18446744073709551615"));
        match Config::from_lookup(lookup(&pairs)).unwrap_err() {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "RELAY_STALE_HOURS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overrides() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("RELAY_POLL_INTERVAL_SECS", "7"),
            ("RELAY_NOTIFY_COOLDOWN_SECS", "60"),
            ("RELAY_STALE_HOURS", "12"),
            ("RELAY_FALLBACK_FACTOR", "0.5"),
            ("RELAY_STALL_TIMEOUT_SECS", "0"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(7));
        assert_eq!(config.listeners.notify_cooldown, Duration::from_secs(60));
        assert_eq!(config.tracker.stale_after, Duration::from_secs(12 * 3600));
        assert_eq!(config.tracker.fallback_factor, 0.5);
        assert_eq!(config.stall_timeout, None);

        let settings = config.monitor_settings();
        assert_eq!(settings.tick_interval, Duration::from_secs(7));
        assert_eq!(settings.stall_timeout, None);
    }

    #[test]
    fn test_invalid_values() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RELAY_POLL_INTERVAL_SECS", "soon"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_POLL_INTERVAL_SECS"));

        let mut pairs = MINIMAL.to_vec();
        pairs[2] = ("RELAY_ALLOWED_USERS", "11,bob");
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RELAY_FALLBACK_FACTOR", "1.5"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    /// Clears RELAY_* vars around `f` and restores them after
    fn with_clean_env<F: FnOnce() -> R, R>(f: F) -> R {
        let saved: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("RELAY_"))
            .collect();
        for (key, _) in &saved {
            env::remove_var(key);
        }
        let result = f();
        for (key, _) in MINIMAL {
            env::remove_var(key);
        }
        for (key, value) in saved {
            env::set_var(key, value);
        }
        result
    }

    #[test]
    #[serial]
    fn test_from_env() {
        with_clean_env(|| {
            assert!(matches!(Config::from_env(), Err(ConfigError::Missing(ref k)) if k.len() == 3));

            for (key, value) in MINIMAL {
                env::set_var(key, value);
            }
            let config = Config::from_env().unwrap();
            assert_eq!(config.bot_token, "123:abc");
            assert_eq!(config.state_dir, PathBuf::from("/tmp/relay-state"));
        });
    }
}
