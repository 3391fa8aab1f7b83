//! Event payloads published by a supervised process.
//!
//! A `ServerHandle` reports at most one `StartupFailure` and exactly one
//! `ExitInfo`; these types are what travels over those channels.

use std::fmt;

use crate::error::SupervisorError;

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exited with code 0 and no signal.
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Why a launch is considered failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupFailureKind {
    /// Output matched a fatal error pattern.
    FatalOutput,
    /// Output stopped growing past the stall threshold.
    Stalled,
    /// Process exited with a failure before it was confirmed ready.
    PrematureExit,
}

/// The single startup-error report of a `ServerHandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupFailure {
    pub kind: StartupFailureKind,
    pub reason: String,
    /// Everything the process printed (stdout then stderr) up to the report.
    pub output: String,
    pub exit: Option<ExitInfo>,
}

impl From<StartupFailure> for SupervisorError {
    fn from(failure: StartupFailure) -> Self {
        match failure.kind {
            StartupFailureKind::Stalled => SupervisorError::StartupStalled {
                reason: failure.reason,
                output: failure.output,
            },
            StartupFailureKind::FatalOutput | StartupFailureKind::PrematureExit => {
                SupervisorError::StartupFailed {
                    reason: failure.reason,
                    output: failure.output,
                    exit_code: failure.exit.and_then(|exit| exit.code),
                }
            }
        }
    }
}
