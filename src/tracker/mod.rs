mod state;
mod store;

pub use state::{SessionStateStore, StateRecord};
pub use store::{load_map, save_json, save_map, StoreError};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::tmux::ScreenAccessor;

static RE_NUMERIC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)-\d+$").unwrap());

/// Strips a trailing `-<digits>` suffix: `claude_demo-8` becomes `claude_demo`.
pub fn normalize_session_name(name: &str) -> &str {
    RE_NUMERIC_SUFFIX
        .captures(name)
        .and_then(|c| c.get(1))
        .map_or(name, |m| m.as_str())
}

pub fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Tunable thresholds for record trust and the fallback estimate
#[derive(Debug, Clone)]
pub struct TrackerPolicy {
    /// Records older than this are discarded
    pub stale_after: Duration,
    /// Future timestamps are rewritten to this far in the past
    pub future_correction_age: Duration,
    pub fallback_factor: f64,
    pub fallback_min_secs: f64,
    pub fallback_max_secs: f64,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 3600),
            future_correction_age: Duration::from_secs(30 * 60),
            fallback_factor: 0.8,
            fallback_min_secs: 300.0,
            fallback_max_secs: 7200.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSource {
    Recorded,
    Estimated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitTime {
    pub seconds: f64,
    pub source: WaitSource,
}

impl WaitTime {
    /// `12m`, or `~2h 5m` for an estimate
    pub fn describe(&self) -> String {
        let text = format_duration(self.seconds);
        match self.source {
            WaitSource::Recorded => text,
            WaitSource::Estimated => format!("~{}", text),
        }
    }
}

pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub corrected: Vec<String>,
    pub dropped: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.corrected.is_empty() && self.dropped.is_empty()
    }
}

/// Session name to last-completion Unix timestamp, persisted as one JSON object
pub struct WaitTimeTracker {
    path: PathBuf,
    records: Mutex<HashMap<String, f64>>,
    policy: TrackerPolicy,
    sessions: Option<Arc<dyn ScreenAccessor>>,
}

impl WaitTimeTracker {
    /// Loads the store and repairs bad timestamps
    pub fn open(path: impl Into<PathBuf>, policy: TrackerPolicy) -> Self {
        let tracker = Self::load(path, policy);
        let report = tracker.validate_and_fix_timestamps();
        if !report.is_clean() {
            info!(
                corrected = report.corrected.len(),
                dropped = report.dropped.len(),
                "repaired completion records"
            );
        }
        tracker
    }

    /// Loads the store as-is
    pub fn load(path: impl Into<PathBuf>, policy: TrackerPolicy) -> Self {
        let path = path.into();
        let raw: HashMap<String, serde_json::Value> = load_map(&path);
        let records: HashMap<String, f64> = raw
            .into_iter()
            .filter_map(|(name, value)| match value.as_f64() {
                Some(ts) if ts.is_finite() => Some((name, ts)),
                _ => {
                    warn!(session = %name, "ignoring non-numeric completion record");
                    None
                }
            })
            .collect();
        debug!(path = %path.display(), count = records.len(), "loaded completion records");

        Self {
            path,
            records: Mutex::new(records),
            policy,
            sessions: None,
        }
    }

    /// Source of session creation times for the fallback estimate
    pub fn with_session_source(mut self, sessions: Arc<dyn ScreenAccessor>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &TrackerPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> HashMap<String, f64> {
        self.lock().clone()
    }

    fn persist(&self, records: &HashMap<String, f64>) -> Result<(), StoreError> {
        save_map(&self.path, records)
    }

    /// Overwrites the exact-name record with now
    pub fn mark_completion(&self, session: &str) -> Result<(), StoreError> {
        let mut records = self.lock();
        records.insert(session.to_string(), now_unix());
        self.persist(&records)
    }

    /// Replaces every record sharing the session's base name with one
    /// record under the exact name.
    pub fn mark_completion_safe(&self, session: &str) -> Result<(), StoreError> {
        let base = normalize_session_name(session);
        let mut records = self.lock();

        let replaced: Vec<String> = records
            .keys()
            .filter(|k| normalize_session_name(k) == base)
            .cloned()
            .collect();
        for key in &replaced {
            records.remove(key);
        }
        records.insert(session.to_string(), now_unix());
        self.persist(&records)?;

        if replaced.is_empty() {
            info!(session, base, "created completion record");
        } else {
            info!(session, base, replaced = ?replaced, "updated completion record");
        }
        Ok(())
    }

    /// Exact name first, then the freshest record with the same base name.
    /// Stale records count as absent.
    fn lookup(&self, records: &HashMap<String, f64>, session: &str, now: f64) -> Option<f64> {
        let ceiling = self.policy.stale_after.as_secs_f64();
        let fresh = |ts: f64| now - ts <= ceiling;

        if let Some(&ts) = records.get(session) {
            if fresh(ts) {
                return Some(ts);
            }
            debug!(session, age = now - ts, "exact completion record is stale");
        }

        let base = normalize_session_name(session);
        records
            .iter()
            .filter(|(k, _)| k.as_str() != session && normalize_session_name(k) == base)
            .map(|(_, &ts)| ts)
            .filter(|&ts| fresh(ts))
            .max_by(f64::total_cmp)
    }

    pub fn has_completion_record(&self, session: &str) -> bool {
        let records = self.lock();
        self.lookup(&records, session, now_unix()).is_some()
    }

    pub async fn get_wait_time_since_completion(&self, session: &str) -> WaitTime {
        let now = now_unix();
        let recorded = {
            let records = self.lock();
            self.lookup(&records, session, now)
        };

        match recorded {
            Some(ts) => WaitTime {
                seconds: (now - ts).max(0.0),
                source: WaitSource::Recorded,
            },
            None => WaitTime {
                seconds: self.fallback_estimate(session, now).await,
                source: WaitSource::Estimated,
            },
        }
    }

    /// Discounted session age, kept within the policy bounds
    async fn fallback_estimate(&self, session: &str, now: f64) -> f64 {
        let created = match &self.sessions {
            Some(sessions) => match sessions.session_created_at(session).await {
                Ok(created) => created,
                Err(e) => {
                    debug!(session, error = %e, "no creation time for fallback estimate");
                    None
                }
            },
            None => None,
        };

        let min = self.policy.fallback_min_secs;
        let max = self.policy.fallback_max_secs;
        match created {
            Some(created) => ((now - created as f64) * self.policy.fallback_factor)
                .max(min)
                .min(max),
            None => min,
        }
    }

    /// Rewrites future timestamps and drops stale ones, persisting any change
    pub fn validate_and_fix_timestamps(&self) -> ValidationReport {
        let now = now_unix();
        let ceiling = self.policy.stale_after.as_secs_f64();
        let corrected_ts = now - self.policy.future_correction_age.as_secs_f64();
        let mut report = ValidationReport::default();
        let mut records = self.lock();

        for (session, ts) in records.iter_mut() {
            if *ts > now {
                warn!(session = %session, timestamp = *ts, "completion record in the future");
                *ts = corrected_ts;
                report.corrected.push(session.clone());
            }
        }

        records.retain(|session, ts| {
            let keep = now - *ts <= ceiling;
            if !keep {
                warn!(session = %session, age_secs = now - *ts, "dropping stale completion record");
                report.dropped.push(session.clone());
            }
            keep
        });

        if !report.is_clean() {
            if let Err(e) = self.persist(&records) {
                warn!(error = %e, "failed to persist repaired completion records");
            }
        }
        report
    }

    /// Removes records older than `max_age_hours`. Returns how many went.
    pub fn cleanup_old_sessions(&self, max_age_hours: u64) -> usize {
        let now = now_unix();
        let ceiling = max_age_hours.saturating_mul(3600) as f64;
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, ts| now - *ts <= ceiling);
        let removed = before - records.len();

        if removed > 0 {
            info!(removed, max_age_hours, "cleaned up old completion records");
            if let Err(e) = self.persist(&records) {
                warn!(error = %e, "failed to persist completion record cleanup");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::ScriptedAccessor;

    fn write_records(path: &Path, records: &[(&str, f64)]) {
        let map: HashMap<String, f64> = records
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        save_map(path, &map).unwrap();
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_session_name("claude_demo-8"), "claude_demo");
        assert_eq!(normalize_session_name("claude_demo-1234"), "claude_demo");
        assert_eq!(normalize_session_name("claude_demo"), "claude_demo");
        assert_eq!(normalize_session_name("a-12-34"), "a-12");
        assert_eq!(normalize_session_name("build-x"), "build-x");
        assert_eq!(normalize_session_name("-5"), "-5");
        assert_eq!(normalize_session_name("name-"), "name-");
    }

    #[test]
    fn test_normalize_round_trip() {
        for base in ["claude", "claude_api", "my-project", "x"] {
            for digits in ["0", "7", "42", "99999"] {
                let name = format!("{}-{}", base, digits);
                assert_eq!(normalize_session_name(&name), base);
            }
            assert_eq!(normalize_session_name(base), base);
        }
    }

    #[test]
    fn test_record_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());

        tracker.mark_completion_safe("claude_demo-3").unwrap();
        let before = now_unix();
        tracker.mark_completion_safe("claude_demo-8").unwrap();
        let after = now_unix();

        let records = tracker.records();
        assert_eq!(records.len(), 1);
        let ts = records["claude_demo-8"];
        assert!(ts >= before && ts <= after);

        let on_disk: HashMap<String, f64> = load_map(&path);
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk.contains_key("claude_demo-8"));
    }

    #[test]
    fn test_naive_mark_keeps_variants() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = WaitTimeTracker::open(dir.path().join("t.json"), TrackerPolicy::default());
        tracker.mark_completion("claude-1").unwrap();
        tracker.mark_completion("claude-2").unwrap();
        assert_eq!(tracker.records().len(), 2);
    }

    #[test]
    fn test_base_name_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = WaitTimeTracker::open(dir.path().join("t.json"), TrackerPolicy::default());
        tracker.mark_completion_safe("claude_api-2").unwrap();

        assert!(tracker.has_completion_record("claude_api-2"));
        assert!(tracker.has_completion_record("claude_api-9"));
        assert!(tracker.has_completion_record("claude_api"));
        assert!(!tracker.has_completion_record("claude_web-2"));
    }

    #[test]
    fn test_exact_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let now = now_unix();
        write_records(&path, &[("claude-1", now - 100.0), ("claude-2", now - 4000.0)]);
        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());

        let records = tracker.records();
        let lookup = |s: &str| tracker.lookup(&records, s, now);
        assert_eq!(lookup("claude-2"), Some(now - 4000.0));
        assert_eq!(lookup("claude-1"), Some(now - 100.0));
        // no exact record: freshest sibling
        assert_eq!(lookup("claude-3"), Some(now - 100.0));
    }

    #[tokio::test]
    async fn test_recorded_wait_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        write_records(&path, &[("claude", now_unix() - 600.0)]);
        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());

        let wait = tracker.get_wait_time_since_completion("claude").await;
        assert_eq!(wait.source, WaitSource::Recorded);
        assert!(wait.seconds >= 599.0 && wait.seconds < 700.0);
    }

    #[tokio::test]
    async fn test_stale_record_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        write_records(&path, &[("claude_old", now_unix() - 25.0 * 3600.0)]);

        // load without validation so the lazy staleness check is what runs
        let tracker = WaitTimeTracker::load(&path, TrackerPolicy::default());
        assert!(!tracker.has_completion_record("claude_old"));

        let wait = tracker.get_wait_time_since_completion("claude_old").await;
        let policy = TrackerPolicy::default();
        assert_eq!(wait.source, WaitSource::Estimated);
        assert!(wait.seconds >= policy.fallback_min_secs);
        assert!(wait.seconds <= policy.fallback_max_secs);
    }

    #[tokio::test]
    async fn test_fallback_from_session_age() {
        let dir = tempfile::tempdir().unwrap();
        let screens = Arc::new(ScriptedAccessor::new());
        let created = now_unix() as i64 - 1000;
        screens.add_session_created("claude", created);

        let tracker = WaitTimeTracker::open(dir.path().join("t.json"), TrackerPolicy::default())
            .with_session_source(screens.clone());
        let wait = tracker.get_wait_time_since_completion("claude").await;
        assert_eq!(wait.source, WaitSource::Estimated);
        // 0.8 of ~1000s
        assert!(wait.seconds >= 795.0 && wait.seconds <= 810.0);

        screens.add_session_created("ancient", created - 10 * 24 * 3600);
        let wait = tracker.get_wait_time_since_completion("ancient").await;
        assert_eq!(wait.seconds, 7200.0);

        screens.add_session_created("fresh", now_unix() as i64);
        let wait = tracker.get_wait_time_since_completion("fresh").await;
        assert_eq!(wait.seconds, 300.0);
    }

    #[test]
    fn test_future_timestamp_correction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        write_records(&path, &[("claude", now_unix() + 10000.0)]);

        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());
        let now = now_unix();
        let fixed = tracker.records()["claude"];
        assert!(fixed < now);

        let on_disk: HashMap<String, f64> = load_map(&path);
        assert_eq!(on_disk["claude"], fixed);
    }

    #[test]
    fn test_validation_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let now = now_unix();
        write_records(&path, &[("old", now - 30.0 * 3600.0), ("new", now - 60.0)]);

        let tracker = WaitTimeTracker::load(&path, TrackerPolicy::default());
        let report = tracker.validate_and_fix_timestamps();
        assert_eq!(report.dropped, vec!["old".to_string()]);
        assert!(report.corrected.is_empty());

        let on_disk: HashMap<String, f64> = load_map(&path);
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk.contains_key("new"));
    }

    #[test]
    fn test_cleanup_old_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        let now = now_unix();
        write_records(&path, &[("a", now - 3.0 * 3600.0), ("b", now - 60.0)]);

        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());
        assert_eq!(tracker.cleanup_old_sessions(2), 1);
        assert_eq!(tracker.cleanup_old_sessions(2), 0);
        assert!(tracker.records().contains_key("b"));
    }

    #[test]
    fn test_corrupt_store_and_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(&path, "[[[").unwrap();
        let tracker = WaitTimeTracker::open(&path, TrackerPolicy::default());
        assert!(tracker.records().is_empty());

        // subsequent writes replace the corrupt file
        tracker.mark_completion_safe("claude").unwrap();
        let on_disk: HashMap<String, f64> = load_map(&path);
        assert_eq!(on_disk.len(), 1);

        std::fs::write(&path, r#"{"a": "soon", "b": 1.5e20}"#).unwrap();
        let tracker = WaitTimeTracker::load(&path, TrackerPolicy::default());
        assert_eq!(tracker.records().len(), 1);
    }

    #[test]
    fn test_describe() {
        let recorded = WaitTime {
            seconds: 754.0,
            source: WaitSource::Recorded,
        };
        assert_eq!(recorded.describe(), "12m");
        let estimated = WaitTime {
            seconds: 7500.0,
            source: WaitSource::Estimated,
        };
        assert_eq!(estimated.describe(), "~2h 5m");
        assert_eq!(format_duration(42.0), "42s");
    }
}
