//! Startup state classification.
//!
//! A freshly launched server is judged purely from what it has printed so far
//! and how long it has been running: a known fatal message means it failed, no
//! new output past the stall threshold means it is stuck, anything else means
//! it is still starting.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

/// A fatal-error regular expression and the description reported on match.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub pattern: Regex,
    pub description: String,
}

impl ErrorPattern {
    /// Compiles `pattern` into an `ErrorPattern`.
    pub fn new(pattern: &str, description: impl Into<String>) -> Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("invalid error pattern {}", pattern))?;
        Ok(Self {
            pattern,
            description: description.into(),
        })
    }
}

/// Classification of a process that has not yet been confirmed ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupState {
    /// No terminal condition yet.
    Starting,
    /// Output stopped growing past the stall threshold.
    Stalled { reason: String },
    /// Output matched a fatal pattern.
    Failed { reason: String },
}

/// Classifies accumulated startup output.
///
/// Fatal patterns are checked first, in order, and win over stall detection.
/// A stall requires both `elapsed > stall_timeout` (exclusive) and no growth
/// since `previous_output`.
pub fn classify(
    output: &str,
    previous_output: &str,
    elapsed: Duration,
    stall_timeout: Duration,
    patterns: &[ErrorPattern],
) -> StartupState {
    if let Some(hit) = match_fatal(output, patterns) {
        return StartupState::Failed {
            reason: hit.description.clone(),
        };
    }
    if elapsed > stall_timeout && output == previous_output {
        return StartupState::Stalled {
            reason: format!("no output growth for {} ms", elapsed.as_millis()),
        };
    }
    StartupState::Starting
}

/// First pattern in `patterns` that matches `output`.
pub fn match_fatal<'a>(output: &str, patterns: &'a [ErrorPattern]) -> Option<&'a ErrorPattern> {
    patterns.iter().find(|p| p.pattern.is_match(output))
}

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (r"EADDRINUSE|[Aa]ddress already in use", "Port already in use"),
    (r"EACCES|listen .*[Pp]ermission denied", "Permission denied while binding"),
    (r"Cannot find module|ModuleNotFoundError", "Missing module"),
    (r"command not found", "Command not found"),
    (r"SyntaxError:", "Syntax error"),
    (r"Uncaught (?:Exception|Error)|UnhandledPromiseRejection", "Uncaught exception"),
    (r"thread '.*' panicked at", "Rust panic"),
    (r"Traceback \(most recent call last\)", "Python exception"),
];

/// Built-in fatal-error patterns for common server stacks.
pub fn default_error_patterns() -> Vec<ErrorPattern> {
    DEFAULT_PATTERNS
        .iter()
        .filter_map(|(pattern, description)| ErrorPattern::new(pattern, *description).ok())
        .collect()
}
