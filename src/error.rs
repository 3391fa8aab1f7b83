//! Error types for supervision runs.
//!
//! `SupervisorError` is the terminal taxonomy reported by the orchestrator; each
//! variant maps to the process exit code the CLI returns. `ReadinessError` is the
//! narrower error produced by the readiness probes when a check cannot be
//! performed at all (as opposed to "not available yet").

use std::io;

use thiserror::Error;

/// Failure of a readiness probe operation.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("failed to probe port {port}: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Terminal failure of a supervision run.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("port {port} is already in use")]
    PortUnavailable { port: u16 },

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("server failed to start: {reason}")]
    StartupFailed {
        reason: String,
        output: String,
        exit_code: Option<i32>,
    },

    #[error("server stalled during startup: {reason}")]
    StartupStalled { reason: String, output: String },

    #[error("{target} not ready within {timeout_ms}ms")]
    ReadinessTimeout { target: String, timeout_ms: u64 },

    #[error("verification command exited with code {code}")]
    VerificationFailed { code: i32 },

    #[error("verification command timed out after {timeout_ms}ms")]
    VerificationTimeout { timeout_ms: u64 },

    #[error("failed to run verification command `{command}`: {reason}")]
    VerificationSpawn { command: String, reason: String },

    #[error("failed to stop process {pid}: {reason}")]
    Kill { pid: u32, reason: String },
}

impl SupervisorError {
    /// Exit code the supervising process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::VerificationFailed { code } if *code != 0 => *code,
            Self::StartupFailed {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }

    /// Captured startup output, for failures that carry it.
    pub fn startup_output(&self) -> Option<&str> {
        match self {
            Self::StartupFailed { output, .. } | Self::StartupStalled { output, .. } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }
}
