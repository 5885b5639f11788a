use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::patterns::ConfidenceTier;

/// Default number of missed cases kept
pub const DEFAULT_MISSED_CASE_CAPACITY: usize = 200;

/// A lower-tier pattern seen in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub tier: ConfidenceTier,
    pub label: String,
}

/// Snapshot that showed activity-like text but was classified not working
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedCase {
    pub session: String,
    pub recorded_at: DateTime<Utc>,
    pub patterns: Vec<PatternMatch>,
    pub tail: String,
}

/// Bounded FIFO of missed cases for pattern-promotion review
#[derive(Debug)]
pub struct MissedCaseLog {
    entries: VecDeque<MissedCase>,
    capacity: usize,
}

impl MissedCaseLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, case: MissedCase) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(case);
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<MissedCase> {
        self.entries.iter().cloned().collect()
    }

    /// How often each label shows up, most frequent first
    pub fn pattern_frequencies(&self) -> Vec<(String, ConfidenceTier, usize)> {
        let mut counts: HashMap<(&str, ConfidenceTier), usize> = HashMap::new();
        for case in &self.entries {
            for hit in &case.patterns {
                *counts.entry((hit.label.as_str(), hit.tier)).or_default() += 1;
            }
        }

        let mut freq: Vec<_> = counts
            .into_iter()
            .map(|((label, tier), n)| (label.to_string(), tier, n))
            .collect();
        freq.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        freq
    }
}

impl Default for MissedCaseLog {
    fn default() -> Self {
        Self::new(DEFAULT_MISSED_CASE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(session: &str, labels: &[(&str, ConfidenceTier)]) -> MissedCase {
        MissedCase {
            session: session.to_string(),
            recorded_at: Utc::now(),
            patterns: labels
                .iter()
                .map(|(l, t)| PatternMatch {
                    tier: *t,
                    label: l.to_string(),
                })
                .collect(),
            tail: String::new(),
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let mut log = MissedCaseLog::new(2);
        log.record(case("a", &[]));
        log.record(case("b", &[]));
        log.record(case("c", &[]));

        let sessions: Vec<_> = log.entries().into_iter().map(|c| c.session).collect();
        assert_eq!(sessions, vec!["b", "c"]);
    }

    #[test]
    fn test_pattern_frequencies() {
        let mut log = MissedCaseLog::default();
        log.record(case("a", &[("Running", ConfidenceTier::Medium)]));
        log.record(case(
            "a",
            &[
                ("Running", ConfidenceTier::Medium),
                ("spinner", ConfidenceTier::Low),
            ],
        ));

        let freq = log.pattern_frequencies();
        assert_eq!(freq[0], ("Running".to_string(), ConfidenceTier::Medium, 2));
        assert_eq!(freq[1], ("spinner".to_string(), ConfidenceTier::Low, 1));
    }
}
