//! Quality gate for provider output.
//!
//! Workers score every synthesis with a [`QualityEvaluator`] and only
//! accept it when the score reaches the configured threshold.

mod evaluator;

pub use evaluator::{
    HeuristicEvaluator, QualityEvaluator, QualityIssue, QualityReport, Severity,
    DEFAULT_MIN_LENGTH, DEFAULT_QUALITY_THRESHOLD,
};
