//! Heuristic quality gate for generated notes.
//!
//! Seven independent checks, each worth one point. A critical finding
//! (the model talking about itself instead of the lecture) zeroes the score.

use std::fmt;

/// Default pass threshold applied to evaluator scores.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;

/// Default minimum character count for the length check.
pub const DEFAULT_MIN_LENGTH: usize = 1500;

const TOTAL_CHECKS: usize = 7;

/// Lecture-name keywords that make code blocks mandatory.
const TECHNICAL_KEYWORDS: &[&str] = &["code", "spring", "java", "rust", "programming", "api"];

/// Phrases that show the persona's practical voice.
const VOICE_PHRASES: &[&str] = &[
    "production",
    "real-world",
    "actually",
    "here's the thing",
    "gotcha",
    "in practice",
    "battle-tested",
    "trade-off",
];

/// Meta-commentary that means the model broke character. Auto-fail.
const CRITICAL_MARKERS: &[&str] = &[
    "i have processed",
    "i generated these",
    "this script",
    "as an ai",
    "i cannot access",
    "files have been processed",
    "batch processing completed",
    "script completed",
];

/// Words that often appear legitimately ("automated testing") but may hint at
/// meta-commentary. They cost the check its point without failing the text.
const MINOR_MARKERS: &[&str] = &["automated", "processed", "generated"];

/// Quality issue severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Fails the output outright.
    Critical,
    /// Costs the check its point.
    Major,
    /// Logged, but the check still scores nothing.
    Minor,
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityIssue {
    pub severity: Severity,
    pub description: String,
}

impl QualityIssue {
    fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
        }
    }
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Critical => write!(f, "CRITICAL: {}", self.description),
            Severity::Major => f.write_str(&self.description),
            Severity::Minor => write!(f, "minor: {}", self.description),
        }
    }
}

/// Score in `[0, 1]` plus the issues that lowered it.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub score: f64,
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn passes(&self, threshold: f64) -> bool {
        self.score >= threshold
    }

    /// Comma-separated issue list for error messages.
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Scores generated text. Must be pure: no I/O, no shared mutable state.
pub trait QualityEvaluator: Send + Sync {
    fn evaluate(&self, text: &str, display_name: &str) -> QualityReport;
}

/// The default markdown-notes evaluator.
#[derive(Debug, Clone)]
pub struct HeuristicEvaluator {
    min_length: usize,
}

impl Default for HeuristicEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LENGTH)
    }
}

impl HeuristicEvaluator {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl QualityEvaluator for HeuristicEvaluator {
    fn evaluate(&self, text: &str, display_name: &str) -> QualityReport {
        let mut issues = Vec::new();
        let mut passed = 0usize;
        let lower = text.to_lowercase();

        let length = text.chars().count();
        if length >= self.min_length {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(
                Severity::Major,
                format!("too short ({} chars, min {})", length, self.min_length),
            ));
        }

        if text.contains("##") {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(Severity::Major, "missing section headers"));
        }

        let technical = {
            let name = display_name.to_lowercase();
            TECHNICAL_KEYWORDS.iter().any(|k| name.contains(k))
        };
        if !technical || text.contains("```") {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(
                Severity::Major,
                "technical lecture without code blocks",
            ));
        }

        if VOICE_PHRASES.iter().any(|p| lower.contains(p)) {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(Severity::Major, "missing persona voice"));
        }

        let critical = CRITICAL_MARKERS.iter().any(|m| lower.contains(m));
        if critical {
            issues.push(QualityIssue::new(Severity::Critical, "meta-commentary detected"));
        } else if MINOR_MARKERS.iter().any(|m| lower.contains(m)) {
            issues.push(QualityIssue::new(
                Severity::Minor,
                "possible automation language",
            ));
        } else {
            passed += 1;
        }

        if ["- ", "* ", "1. ", "• "].iter().any(|m| text.contains(m)) {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(Severity::Major, "missing lists"));
        }

        if text.contains("**") || text.contains('*') || text.contains("__") {
            passed += 1;
        } else {
            issues.push(QualityIssue::new(Severity::Major, "missing emphasis"));
        }

        let score = if critical {
            0.0
        } else {
            passed as f64 / TOTAL_CHECKS as f64
        };

        QualityReport { score, issues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE_BLOCK: &str = "```rust\nlet a = b;\n```\n";

    fn padded(mut notes: String) -> String {
        while notes.chars().count() < DEFAULT_MIN_LENGTH {
            notes.push_str("### Detail\nIn practice the borrow checker keeps you honest.\n");
        }
        notes
    }

    fn good_notes() -> String {
        let mut notes = String::from("## Ownership\n\n**Key idea**: in production code, ");
        notes.push_str("moves are explicit.\n\n- borrow first\n- clone last\n\n");
        notes.push_str(CODE_BLOCK);
        padded(notes)
    }

    fn notes_without_code() -> String {
        padded(String::from(
            "## Ownership\n\n**Key idea**: in production code, moves are explicit.\n\n- borrow first\n- clone last\n\n",
        ))
    }

    #[test]
    fn test_full_marks() {
        let report = HeuristicEvaluator::default().evaluate(&good_notes(), "rust-ownership");
        assert_eq!(report.score, 1.0);
        assert!(report.issues.is_empty());
        assert!(report.passes(DEFAULT_QUALITY_THRESHOLD));
    }

    #[test]
    fn test_short_plain_text_fails() {
        let report = HeuristicEvaluator::default().evaluate("some notes", "intro");
        assert!(!report.passes(DEFAULT_QUALITY_THRESHOLD));
        assert!(report.summary().contains("too short"));
        // Only the code-block check (not technical) and the clean-language check pass.
        assert!((report.score - 2.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_meta_commentary_zeroes_score() {
        let text = format!("{}\nAs an AI I cannot access the files.", good_notes());
        let report = HeuristicEvaluator::default().evaluate(&text, "rust-ownership");
        assert_eq!(report.score, 0.0);
        assert!(report
            .issues
            .iter()
            .any(|i| i.severity == Severity::Critical));
    }

    #[test]
    fn test_minor_markers_cost_one_point() {
        let text = format!("{}\nAutomated tests run in CI.", good_notes());
        let report = HeuristicEvaluator::default().evaluate(&text, "rust-ownership");
        assert!((report.score - 6.0 / 7.0).abs() < 1e-9);
        assert!(report.passes(DEFAULT_QUALITY_THRESHOLD));
    }

    #[test]
    fn test_technical_lecture_requires_code() {
        let text = notes_without_code();
        assert!(text.chars().count() >= DEFAULT_MIN_LENGTH);
        let report = HeuristicEvaluator::default().evaluate(&text, "java-streams");
        assert!(report.summary().contains("code blocks"));

        let report = HeuristicEvaluator::default().evaluate(&text, "team-culture");
        assert_eq!(report.score, 1.0);
    }
}
