use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How much a pattern is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    /// Drives the live decision
    High,
    /// Progress verbs, logged for promotion review
    Medium,
    /// Cognition words and spinners, logged for awareness only
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    Text { needle: String, ignore_case: bool },
    AnyGlyph { glyphs: Vec<char> },
}

impl Matcher {
    fn matches(&self, text: &str, lowered: &str) -> bool {
        match self {
            Matcher::Text {
                needle,
                ignore_case: true,
            } => lowered.contains(&needle.to_lowercase()),
            Matcher::Text { needle, .. } => text.contains(needle.as_str()),
            Matcher::AnyGlyph { glyphs } => text.chars().any(|c| glyphs.contains(&c)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingPattern {
    pub tier: ConfidenceTier,
    pub label: String,
    pub matcher: Matcher,
}

impl WorkingPattern {
    pub fn text(tier: ConfidenceTier, needle: &str, ignore_case: bool) -> Self {
        Self {
            tier,
            label: needle.to_string(),
            matcher: Matcher::Text {
                needle: needle.to_string(),
                ignore_case,
            },
        }
    }

    pub fn glyphs(tier: ConfidenceTier, label: &str, glyphs: &[char]) -> Self {
        Self {
            tier,
            label: label.to_string(),
            matcher: Matcher::AnyGlyph {
                glyphs: glyphs.to_vec(),
            },
        }
    }

    pub fn matches(&self, text: &str, lowered: &str) -> bool {
        self.matcher.matches(text, lowered)
    }
}

/// Interrupt and background hints printed only while the agent is busy
const HIGH_CONFIDENCE_TEXT: &[&str] = &["esc to interrupt", "to run in background"];

const MEDIUM_CONFIDENCE_TEXT: &[&str] = &["Running", "Building", "Installing", "Downloading"];

const LOW_CONFIDENCE_TEXT: &[&str] = &["Thinking", "Processing", "Analyzing", "Searching"];

/// Status-line spinner frames (Claude Code glyphs, then braille dots)
pub const SPINNER_GLYPHS: &[char] = &[
    '✻', '✽', '✶', '✳', '✢', '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏',
];

/// The tiered pattern tables a detector runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSet {
    patterns: Vec<WorkingPattern>,
}

impl Default for PatternSet {
    fn default() -> Self {
        let mut patterns = Vec::new();
        patterns.extend(
            HIGH_CONFIDENCE_TEXT
                .iter()
                .map(|p| WorkingPattern::text(ConfidenceTier::High, p, true)),
        );
        patterns.extend(
            MEDIUM_CONFIDENCE_TEXT
                .iter()
                .map(|p| WorkingPattern::text(ConfidenceTier::Medium, p, false)),
        );
        patterns.extend(
            LOW_CONFIDENCE_TEXT
                .iter()
                .map(|p| WorkingPattern::text(ConfidenceTier::Low, p, false)),
        );
        patterns.push(WorkingPattern::glyphs(
            ConfidenceTier::Low,
            "spinner",
            SPINNER_GLYPHS,
        ));
        Self { patterns }
    }
}

impl PatternSet {
    pub fn new(patterns: Vec<WorkingPattern>) -> Self {
        Self { patterns }
    }

    pub fn all(&self) -> &[WorkingPattern] {
        &self.patterns
    }

    pub fn tier(&self, tier: ConfidenceTier) -> impl Iterator<Item = &WorkingPattern> {
        self.patterns.iter().filter(move |p| p.tier == tier)
    }

    /// Moves a pattern into the high tier. Returns false if no pattern has that label.
    pub fn promote(&mut self, label: &str) -> bool {
        match self.patterns.iter_mut().find(|p| p.label == label) {
            Some(pattern) => {
                pattern.tier = ConfidenceTier::High;
                true
            }
            None => false,
        }
    }
}

/// Recognized idle prompts, checked against single lines
static PROMPTS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("boxed input", Regex::new(r"^\s*│\s*>").unwrap()),
        ("bare prompt", Regex::new(r"^\s*[>❯]\s*$").unwrap()),
        ("python repl", Regex::new(r"^\s*>>>(\s.*)?$").unwrap()),
        ("shell", Regex::new(r"(^|[\w~/\]):)]\s?)\$\s?$").unwrap()),
        (
            "generic prompt",
            Regex::new(r"^\s*[\w.@~:/\\\-\[\]() ]*[\w\]):~]>\s*$").unwrap(),
        ),
    ]
});

/// Returns the kind of prompt found on this line, if any
pub fn match_prompt(line: &str) -> Option<&'static str> {
    if line.trim().is_empty() {
        return None;
    }
    PROMPTS
        .iter()
        .find(|(_, re)| re.is_match(line))
        .map(|(kind, _)| *kind)
}

/// Interactive questions and choice menus that need a human
static RE_WAITING_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?mi)(do you want to (proceed|continue|make this edit|create|run|allow)|would you like to|\[y/n\]|\(y/n\)|press enter to|waiting for (your )?input|^\s*❯\s*\d+\.\s+\S)",
    )
    .unwrap()
});

pub fn matches_waiting_input(text: &str) -> bool {
    RE_WAITING_INPUT.is_match(text)
}

/// Hints that only appear while work is ongoing, used by the simple detector
const SIMPLE_WORKING_PHRASES: &[&str] = &["esc to interrupt", "to run in background"];

/// Wrap-up states that can share the screen with a stale working hint
const FINISHED_PHRASES: &[&str] = &[
    "accept edits",
    "plan mode on",
    "interrupted by user",
];

static RE_FINISHED_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(worked|cooked|baked|brewed|churned|crunched|sautéed) for \d").unwrap()
});

pub fn matches_simple_working(lowered: &str) -> bool {
    SIMPLE_WORKING_PHRASES.iter().any(|p| lowered.contains(p))
}

pub fn matches_finished(lowered: &str) -> bool {
    FINISHED_PHRASES.iter().any(|p| lowered.contains(p)) || RE_FINISHED_LABEL.is_match(lowered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers() {
        let set = PatternSet::default();
        let high: Vec<_> = set.tier(ConfidenceTier::High).map(|p| p.label.as_str()).collect();
        assert_eq!(high, vec!["esc to interrupt", "to run in background"]);
        assert_eq!(set.tier(ConfidenceTier::Medium).count(), 4);
        assert_eq!(set.tier(ConfidenceTier::Low).count(), 5);
    }

    #[test]
    fn test_high_tier_ignores_case() {
        let set = PatternSet::default();
        let text = "Working (ESC to interrupt)";
        let lowered = text.to_lowercase();
        assert!(set
            .tier(ConfidenceTier::High)
            .any(|p| p.matches(text, &lowered)));
    }

    #[test]
    fn test_medium_tier_is_case_sensitive() {
        let pattern = WorkingPattern::text(ConfidenceTier::Medium, "Running", false);
        assert!(pattern.matches("Running tests...", "running tests..."));
        assert!(!pattern.matches("still running", "still running"));
    }

    #[test]
    fn test_spinner_glyphs() {
        let pattern = WorkingPattern::glyphs(ConfidenceTier::Low, "spinner", SPINNER_GLYPHS);
        assert!(pattern.matches("✻ Pondering…", ""));
        assert!(!pattern.matches("plain text", ""));
    }

    #[test]
    fn test_promote() {
        let mut set = PatternSet::default();
        assert!(set.promote("Building"));
        assert!(set
            .tier(ConfidenceTier::High)
            .any(|p| p.label == "Building"));
        assert!(!set.promote("nonexistent"));
    }

    #[test]
    fn test_prompts() {
        assert_eq!(match_prompt(">"), Some("bare prompt"));
        assert_eq!(match_prompt("  > "), Some("bare prompt"));
        assert_eq!(match_prompt("│ >                     │"), Some("boxed input"));
        assert_eq!(match_prompt("user@host:~/src$ "), Some("shell"));
        assert_eq!(match_prompt("$"), Some("shell"));
        assert_eq!(match_prompt(">>> "), Some("python repl"));
        assert_eq!(match_prompt("mysql>"), Some("generic prompt"));
        assert_eq!(match_prompt("~/src $ "), Some("shell"));
        assert_eq!(match_prompt("(venv) me $ "), Some("shell"));
        assert_eq!(match_prompt("(venv) db> "), Some("generic prompt"));
    }

    #[test]
    fn test_non_prompts() {
        assert_eq!(match_prompt(""), None);
        assert_eq!(match_prompt("</div>"), None);
        assert_eq!(match_prompt("Task in progress (esc to interrupt)"), None);
        assert_eq!(match_prompt("a -> b"), None);
        assert_eq!(match_prompt("Loading -->"), None);
        assert_eq!(match_prompt("costs 5 $$"), None);
    }

    #[test]
    fn test_waiting_input() {
        assert!(matches_waiting_input("Do you want to proceed?"));
        assert!(matches_waiting_input("Overwrite? [y/N]"));
        assert!(matches_waiting_input(" ❯ 1. Yes\n   2. No"));
        assert!(!matches_waiting_input("1. Install deps\n2. Run tests"));
        assert!(!matches_waiting_input("All tests passed"));
    }

    #[test]
    fn test_finished_phrases() {
        assert!(matches_finished("⏵⏵ accept edits on (shift+tab to cycle)"));
        assert!(matches_finished("✻ worked for 2m 10s"));
        assert!(!matches_finished("esc to interrupt"));
    }
}
