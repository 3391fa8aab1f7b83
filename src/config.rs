//! Configuration file support.
//!
//! This module defines the structure of the `serverwatch.toml` configuration
//! file and provides functionality to load and parse it. Every field is
//! optional; command-line flags take precedence over file values.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::classifier::{default_error_patterns, ErrorPattern};

/// Top-level configuration structure corresponding to `serverwatch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server start command.
    pub command: Option<String>,
    /// Port to pre-check and wait on.
    pub port: Option<u16>,
    /// URL to poll for readiness.
    pub url: Option<String>,
    /// Readiness and verification timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Readiness poll interval in milliseconds.
    pub interval_ms: Option<u64>,
    /// Startup stall threshold in milliseconds.
    pub stall_timeout_ms: Option<u64>,
    /// Delay between the graceful and the forced stop, in milliseconds.
    pub kill_grace_ms: Option<u64>,
    /// Verification command run once the server is ready.
    pub run: Option<String>,
    /// Leave the server running after a successful run.
    pub keep_alive: Option<bool>,
    /// Whether the built-in fatal error patterns apply (default: true).
    pub default_error_patterns: Option<bool>,
    /// Extra environment for the server and the verification command.
    pub env: Option<HashMap<String, String>>,
    /// Additional fatal error patterns.
    #[serde(default, rename = "error_pattern")]
    pub error_patterns: Vec<ErrorPatternConfig>,
}

/// A user-supplied fatal error pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPatternConfig {
    /// Regular expression matched against startup output.
    pub pattern: String,
    /// Reason reported when the pattern matches.
    pub description: String,
}

impl Config {
    /// Compiles the effective fatal error patterns: the built-in set (unless
    /// disabled) followed by the configured ones.
    pub fn build_error_patterns(&self) -> Result<Vec<ErrorPattern>> {
        let mut patterns = if self.default_error_patterns.unwrap_or(true) {
            default_error_patterns()
        } else {
            Vec::new()
        };
        for entry in &self.error_patterns {
            patterns.push(ErrorPattern::new(&entry.pattern, entry.description.clone())?);
        }
        Ok(patterns)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .build_error_patterns()
        .with_context(|| format!("invalid error pattern in {}", path.display()))?;
    Ok(config)
}
