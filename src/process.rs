//! Launch specification and command construction for supervised servers.
//!
//! `LaunchSpec` describes what to run and how its startup is judged; the
//! `build_command` helper turns it into a `tokio::process::Command` with piped
//! output and its own process group, so termination signals reach the whole
//! server tree.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::classifier::{default_error_patterns, ErrorPattern};

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(5_000);

/// Specification for a server process to be supervised.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The start command; split on whitespace into program and arguments.
    pub command: String,
    /// Extra arguments appended after the ones in `command`.
    pub args: Vec<String>,
    /// Environment entries layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Time without output growth after which startup is considered stalled.
    pub stall_timeout: Duration,
    /// Fatal-error patterns, checked in order.
    pub error_patterns: Vec<ErrorPattern>,
    /// Period of the startup classifier.
    pub tick_interval: Duration,
    /// Delay between the graceful signal and the forced kill.
    pub kill_grace: Duration,
}

impl LaunchSpec {
    /// Creates a spec with default timings and the built-in error patterns.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            error_patterns: default_error_patterns(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Program and full argument list, or `None` for a blank command.
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        let mut args: Vec<String> = parts.collect();
        args.extend(self.args.iter().cloned());
        Some((program, args))
    }

    /// Human-readable command line for logs.
    pub fn display_command(&self) -> String {
        match self.program_and_args() {
            Some((program, args)) if args.is_empty() => program,
            Some((program, args)) => format!("{} {}", program, args.join(" ")),
            None => String::new(),
        }
    }
}

/// Builds a command with piped output and the caller's environment overrides.
///
/// On unix the child becomes the leader of a new process group; on windows it
/// gets a new console process group so it can receive CTRL_BREAK.
pub fn build_command(program: &str, args: &[String], env: &HashMap<String, String>) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    if !env.is_empty() {
        command.envs(env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command
}
