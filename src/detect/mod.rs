mod missed;
pub mod patterns;

pub use missed::{MissedCase, MissedCaseLog, PatternMatch, DEFAULT_MISSED_CASE_CAPACITY};
pub use patterns::{ConfidenceTier, PatternSet, WorkingPattern};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Trailing lines considered recent context
pub const DEFAULT_TAIL_LINES: usize = 8;

/// Non-empty lines at the bottom searched for a prompt
const PROMPT_SCAN_LINES: usize = 3;

/// Permission dialogs are taller than the working window
const WAITING_SCAN_LINES: usize = 15;

pub const PROMPT_CONFIDENCE: f64 = 0.95;
pub const HIGH_PATTERN_CONFIDENCE: f64 = 0.95;

/// Discrete state of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Agent is actively processing
    Working,
    /// Agent asked a question or shows a choice menu
    WaitingForInput,
    /// Agent is idle at its prompt
    Idle,
    /// Status cannot be determined
    #[default]
    Unknown,
}

impl SessionState {
    pub fn classify(is_working: bool, waiting_for_input: bool) -> Self {
        if is_working {
            SessionState::Working
        } else if waiting_for_input {
            SessionState::WaitingForInput
        } else {
            SessionState::Idle
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Working => "working",
            SessionState::WaitingForInput => "waiting for input",
            SessionState::Idle => "idle",
            SessionState::Unknown => "unknown",
        }
    }
}

/// Everything one detection pass saw and decided
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionContext {
    pub session: String,
    pub captured_at: DateTime<Utc>,
    pub snapshot: String,
    pub lines_analyzed: usize,
    pub prompt_found: bool,
    /// High-confidence labels that matched
    pub matched_patterns: Vec<String>,
    /// Every pattern that matched, any tier
    pub observed_patterns: Vec<PatternMatch>,
    pub is_working: bool,
    pub confidence: f64,
    pub reasoning: String,
}

impl DetectionContext {
    fn empty(session: &str, snapshot: &str) -> Self {
        Self {
            session: session.to_string(),
            captured_at: Utc::now(),
            snapshot: snapshot.to_string(),
            lines_analyzed: 0,
            prompt_found: false,
            matched_patterns: Vec::new(),
            observed_patterns: Vec::new(),
            is_working: false,
            confidence: 0.0,
            reasoning: "empty content".to_string(),
        }
    }
}

/// Last `n` lines, ignoring the blank padding tmux leaves below the content
pub fn trailing_lines(snapshot: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = snapshot.lines().collect();
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(0, |i| i + 1);
    let start = end.saturating_sub(n);
    lines[start..end].to_vec()
}

/// Tiered detector with a rolling log of potentially missed cases
pub struct WorkingStateDetector {
    patterns: PatternSet,
    tail_lines: usize,
    missed: Mutex<MissedCaseLog>,
}

impl WorkingStateDetector {
    pub fn new() -> Self {
        Self::with_patterns(PatternSet::default())
    }

    pub fn with_patterns(patterns: PatternSet) -> Self {
        Self {
            patterns,
            tail_lines: DEFAULT_TAIL_LINES,
            missed: Mutex::new(MissedCaseLog::default()),
        }
    }

    pub fn detect(&self, session: &str, snapshot: &str) -> DetectionContext {
        if snapshot.trim().is_empty() {
            return DetectionContext::empty(session, snapshot);
        }

        let window = trailing_lines(snapshot, self.tail_lines);
        let text = window.join("\n");
        let lowered = text.to_lowercase();

        let prompt = window
            .iter()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(PROMPT_SCAN_LINES)
            .find_map(|l| patterns::match_prompt(l));

        let observed: Vec<PatternMatch> = self
            .patterns
            .all()
            .iter()
            .filter(|p| p.matches(&text, &lowered))
            .map(|p| PatternMatch {
                tier: p.tier,
                label: p.label.clone(),
            })
            .collect();
        let matched: Vec<String> = observed
            .iter()
            .filter(|m| m.tier == ConfidenceTier::High)
            .map(|m| m.label.clone())
            .collect();

        let (is_working, confidence, reasoning) = if let Some(kind) = prompt {
            (
                false,
                PROMPT_CONFIDENCE,
                format!("{} found in last lines", kind),
            )
        } else if !matched.is_empty() {
            (
                true,
                HIGH_PATTERN_CONFIDENCE,
                format!("high-confidence pattern: {}", matched.join(", ")),
            )
        } else {
            (
                false,
                0.0,
                "no prompt and no high-confidence pattern".to_string(),
            )
        };

        let context = DetectionContext {
            session: session.to_string(),
            captured_at: Utc::now(),
            snapshot: snapshot.to_string(),
            lines_analyzed: window.len(),
            prompt_found: prompt.is_some(),
            matched_patterns: matched,
            observed_patterns: observed,
            is_working,
            confidence,
            reasoning,
        };

        if !context.is_working {
            self.record_missed(&context, &text);
        }

        trace!(
            session,
            working = context.is_working,
            confidence = context.confidence,
            reasoning = %context.reasoning,
            "detection pass"
        );
        context
    }

    /// Lower-tier activity with no decision, or a prompt that hid a
    /// high-confidence hint
    fn record_missed(&self, context: &DetectionContext, tail: &str) {
        let hits: Vec<PatternMatch> = if context.prompt_found {
            if context.matched_patterns.is_empty() {
                return;
            }
            context.observed_patterns.clone()
        } else {
            context
                .observed_patterns
                .iter()
                .filter(|m| m.tier != ConfidenceTier::High)
                .cloned()
                .collect()
        };
        if hits.is_empty() {
            return;
        }

        debug!(
            session = %context.session,
            prompt = context.prompt_found,
            patterns = ?hits.iter().map(|h| h.label.as_str()).collect::<Vec<_>>(),
            "possible missed working state"
        );
        if let Ok(mut log) = self.missed.lock() {
            log.record(MissedCase {
                session: context.session.clone(),
                recorded_at: context.captured_at,
                patterns: hits,
                tail: tail.to_string(),
            });
        }
    }

    pub fn missed_cases(&self) -> Vec<MissedCase> {
        self.missed
            .lock()
            .map(|log| log.entries())
            .unwrap_or_default()
    }

    pub fn pattern_frequencies(&self) -> Vec<(String, ConfidenceTier, usize)> {
        self.missed
            .lock()
            .map(|log| log.pattern_frequencies())
            .unwrap_or_default()
    }
}

impl Default for WorkingStateDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Interactive question or choice menu near the bottom of the screen
pub fn is_waiting_for_input(snapshot: &str) -> bool {
    let window = trailing_lines(snapshot, WAITING_SCAN_LINES).join("\n");
    patterns::matches_waiting_input(&window)
}

/// Boolean variant: working while a busy hint shows, unless a wrap-up phrase
/// says the hint is a stale frame.
pub fn is_working_simple(snapshot: &str) -> bool {
    let lowered = trailing_lines(snapshot, DEFAULT_TAIL_LINES)
        .join("\n")
        .to_lowercase();
    patterns::matches_simple_working(&lowered) && !patterns::matches_finished(&lowered)
}
