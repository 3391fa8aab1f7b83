//! Supervision of a single server process.
//!
//! `launch` spawns the server and returns a `ServerHandle`. Behind the handle a
//! few tasks cooperate on one shared state:
//!
//! - two output pumps that forward stdout/stderr to the caller's sink and append
//!   to the capture buffers,
//! - the startup classifier, ticking on a fixed interval until startup is
//!   completed or a failure is reported,
//! - the exit waiter, which owns the child, records its exit and carries out
//!   forced kills.
//!
//! Results travel over two channels: the single startup-failure report and the
//! exit info. Callers await them through `startup_failure` and `wait_exit`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, match_fatal, ErrorPattern, StartupState};
use crate::error::SupervisorError;
use crate::events::{ExitInfo, StartupFailure, StartupFailureKind};
use crate::output::{sanitize_text, OutputBuffer, OutputSink, StreamKind, Utf8Decoder};
use crate::process::{build_command, LaunchSpec};

const READ_CHUNK: usize = 8 * 1024;
// Grandchildren may keep the pipes open after the leader exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const FORCED_EXIT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// How a call to `ServerHandle::kill` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process had already exited or another call already stopped it.
    AlreadyStopped,
    /// The process exited after the graceful signal.
    Graceful,
    /// The process had to be force-killed after the grace period.
    Forced,
}

struct HandleState {
    output: OutputBuffer,
    startup_completed: bool,
    killed: bool,
    exit: Option<ExitInfo>,
    classifier: Option<JoinHandle<()>>,
    force_kill: Option<oneshot::Sender<()>>,
    graceful_signals: u32,
    forced_signals: u32,
}

impl HandleState {
    fn cancel_classifier(&mut self) {
        if let Some(task) = self.classifier.take() {
            task.abort();
        }
    }
}

struct Shared {
    state: Mutex<HandleState>,
    started: Instant,
    stall_timeout: Duration,
    patterns: Vec<ErrorPattern>,
    startup_tx: watch::Sender<Option<StartupFailure>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    kill_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Publishes `failure` unless startup already completed.
    ///
    /// The flag check and the flag write happen under the caller's lock, so at
    /// most one report is ever delivered.
    fn report_startup_failure(&self, state: &mut HandleState, failure: StartupFailure) -> bool {
        if state.startup_completed {
            return false;
        }
        state.startup_completed = true;
        state.cancel_classifier();
        warn!(
            reason = %failure.reason,
            kind = ?failure.kind,
            "server startup failed"
        );
        self.startup_tx.send_replace(Some(failure));
        true
    }

    /// Captures startup output. Once startup completes, output is only
    /// forwarded to the sink.
    fn append_output(&self, stream: StreamKind, text: &str) {
        let mut state = self.lock();
        if state.startup_completed {
            return;
        }
        state.output.push(stream, text);
        let sanitized = sanitize_text(text);
        let Some(hit) = match_fatal(&sanitized, &self.patterns) else {
            return;
        };
        let failure = StartupFailure {
            kind: StartupFailureKind::FatalOutput,
            reason: hit.description.clone(),
            output: state.output.combined(),
            exit: None,
        };
        self.report_startup_failure(&mut state, failure);
    }
}

/// Handle to one supervised server process.
///
/// Cloning is cheap; all clones refer to the same process.
#[derive(Clone)]
pub struct ServerHandle {
    pid: Option<u32>,
    command: String,
    kill_grace: Duration,
    shared: Arc<Shared>,
    startup_rx: watch::Receiver<Option<StartupFailure>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish()
    }
}

/// Spawns the server described by `spec` and starts supervising it.
///
/// Output is forwarded to `sink` as it arrives. Spawn failures (for example a
/// missing executable) are returned immediately.
pub fn launch(spec: LaunchSpec, sink: Arc<dyn OutputSink>) -> Result<ServerHandle, SupervisorError> {
    let command_line = spec.display_command();
    let Some((program, args)) = spec.program_and_args() else {
        return Err(SupervisorError::Spawn {
            command: command_line,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    info!(command = %command_line, "launching server");
    let mut command = build_command(&program, &args, &spec.env);
    let mut child = command.spawn().map_err(|source| {
        error!(command = %command_line, error = %source, "failed to spawn server");
        SupervisorError::Spawn {
            command: command_line.clone(),
            source,
        }
    })?;
    let pid = child.id();
    info!(pid = pid.unwrap_or(0), "server process started");

    let (startup_tx, startup_rx) = watch::channel(None);
    let (exit_tx, exit_rx) = watch::channel(None);
    let (force_tx, force_rx) = oneshot::channel();
    let shared = Arc::new(Shared {
        state: Mutex::new(HandleState {
            output: OutputBuffer::new(),
            startup_completed: false,
            killed: false,
            exit: None,
            classifier: None,
            force_kill: Some(force_tx),
            graceful_signals: 0,
            forced_signals: 0,
        }),
        started: Instant::now(),
        stall_timeout: spec.stall_timeout,
        patterns: spec.error_patterns,
        startup_tx,
        exit_tx,
        kill_lock: tokio::sync::Mutex::new(()),
    });

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_output(
            stdout,
            StreamKind::Stdout,
            shared.clone(),
            sink.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_output(
            stderr,
            StreamKind::Stderr,
            shared.clone(),
            sink,
        )));
    }

    let classifier = tokio::spawn(run_classifier(shared.clone(), spec.tick_interval));
    {
        let mut state = shared.lock();
        if state.startup_completed {
            classifier.abort();
        } else {
            state.classifier = Some(classifier);
        }
    }

    tokio::spawn(wait_for_exit(shared.clone(), child, pid, force_rx, pumps));

    Ok(ServerHandle {
        pid,
        command: command_line,
        kill_grace: spec.kill_grace,
        shared,
        startup_rx,
        exit_rx,
    })
}

impl ServerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time since launch.
    pub fn uptime(&self) -> Duration {
        self.shared.started.elapsed()
    }

    /// Snapshot of the startup output captured so far.
    #[cfg(test)]
    pub fn output(&self) -> OutputBuffer {
        self.shared.lock().output.clone()
    }

    #[cfg(test)]
    pub fn is_startup_completed(&self) -> bool {
        self.shared.lock().startup_completed
    }

    #[cfg(test)]
    pub fn is_killed(&self) -> bool {
        self.shared.lock().killed
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.shared.lock().exit
    }

    /// The startup failure, if one has been reported.
    pub fn reported_failure(&self) -> Option<StartupFailure> {
        self.startup_rx.borrow().clone()
    }

    /// Confirms that the server is ready.
    ///
    /// Stops the classifier for good. Returns `false` if startup had already
    /// completed, including when a failure was reported first.
    pub fn mark_startup_completed(&self) -> bool {
        let mut state = self.shared.lock();
        if state.startup_completed {
            return false;
        }
        state.startup_completed = true;
        state.cancel_classifier();
        debug!(pid = self.pid.unwrap_or(0), "startup completed");
        true
    }

    /// Waits for the startup failure report.
    ///
    /// Never resolves for a handle that starts successfully.
    pub async fn startup_failure(&self) -> StartupFailure {
        let mut rx = self.startup_rx.clone();
        let failure = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        match failure {
            Some(failure) => failure,
            None => std::future::pending().await,
        }
    }

    /// Waits for the process to exit.
    pub async fn wait_exit(&self) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|value| *value)
    }

    /// Stops the process: graceful signal first, forced kill after the grace period.
    ///
    /// Safe to call repeatedly and concurrently; only the first call signals the
    /// process and later ones resolve as `AlreadyStopped`. Also completes
    /// startup, so teardown is never reported as a startup failure.
    pub async fn kill(&self) -> Result<KillOutcome, SupervisorError> {
        let _serial = self.shared.kill_lock.lock().await;
        let pid = self.pid.unwrap_or(0);
        let force = {
            let mut state = self.shared.lock();
            state.startup_completed = true;
            state.cancel_classifier();
            if state.killed || state.exit.is_some() {
                return Ok(KillOutcome::AlreadyStopped);
            }
            state.killed = true;
            state.graceful_signals += 1;
            state.force_kill.take()
        };

        info!(pid, "stopping server");
        if let Some(pid) = self.pid {
            send_graceful_signal(pid);
        }

        let mut exit_rx = self.exit_rx.clone();
        let graceful = tokio::time::timeout(self.kill_grace, exit_rx.wait_for(Option::is_some))
            .await
            .map(|exited| exited.is_ok());
        match graceful {
            Ok(true) => {
                info!(pid, "server stopped");
                return Ok(KillOutcome::Graceful);
            }
            Ok(false) => {
                return Err(SupervisorError::Kill {
                    pid,
                    reason: "exit watcher stopped".to_string(),
                });
            }
            Err(_) => {}
        }

        warn!(
            pid,
            grace_ms = self.kill_grace.as_millis() as u64,
            "server did not stop in time, killing"
        );
        self.shared.lock().forced_signals += 1;
        if let Some(force) = force {
            let _ = force.send(());
        }
        let forced = tokio::time::timeout(FORCED_EXIT_TIMEOUT, exit_rx.wait_for(Option::is_some))
            .await
            .map(|exited| exited.is_ok());
        match forced {
            Ok(true) => {
                info!(pid, "server killed");
                Ok(KillOutcome::Forced)
            }
            _ => Err(SupervisorError::Kill {
                pid,
                reason: "process did not exit after forced kill".to_string(),
            }),
        }
    }

    /// Stops this server when the supervising process receives SIGINT or SIGTERM.
    ///
    /// After stopping, the supervising process exits with 0 if the kill
    /// succeeded and 1 otherwise. Dropping the guard removes the handler.
    pub fn install_signal_handlers(&self) -> SignalGuard {
        self.stop_on(wait_for_shutdown_signal(), |code| {
            std::process::exit(code);
        })
    }

    /// Stops the server once `shutdown` yields a signal name, then hands the
    /// exit code to `exit`.
    fn stop_on<S, X>(&self, shutdown: S, exit: X) -> SignalGuard
    where
        S: Future<Output = Option<&'static str>> + Send + 'static,
        X: FnOnce(i32) + Send + 'static,
    {
        let handle = self.clone();
        let task = tokio::spawn(async move {
            let Some(signal) = shutdown.await else {
                return;
            };
            warn!(signal, pid = handle.pid.unwrap_or(0), "received signal, stopping server");
            let code = match handle.kill().await {
                Ok(_) => 0,
                Err(err) => {
                    error!(error = %err, "failed to stop server");
                    1
                }
            };
            exit(code);
        });
        SignalGuard { task }
    }

    #[cfg(test)]
    fn signal_counts(&self) -> (u32, u32) {
        let state = self.shared.lock();
        (state.graceful_signals, state.forced_signals)
    }
}

/// Registration of OS signal handling for one `ServerHandle`.
#[derive(Debug)]
pub struct SignalGuard {
    task: JoinHandle<()>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_for_shutdown_signal() -> Option<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                return tokio::signal::ctrl_c().await.ok().map(|_| "SIGINT");
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.ok().map(|_| "SIGINT"),
            _ = sigterm.recv() => Some("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok().map(|_| "CTRL_C")
    }
}

async fn pump_output<R>(
    mut reader: R,
    stream: StreamKind,
    shared: Arc<Shared>,
    sink: Arc<dyn OutputSink>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(?stream, error = %err, "output stream closed");
                break;
            }
        };
        let text = decoder.decode(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        sink.write(stream, &text);
        shared.append_output(stream, &text);
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        sink.write(stream, &rest);
        shared.append_output(stream, &rest);
    }
}

async fn run_classifier(shared: Arc<Shared>, tick: Duration) {
    let tick = tick.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(shared.started + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = String::new();
    loop {
        ticker.tick().await;
        let finished = {
            let mut state = shared.lock();
            if state.startup_completed {
                true
            } else {
                let output = sanitize_text(&state.output.combined());
                let verdict = classify(
                    &output,
                    &previous,
                    shared.started.elapsed(),
                    shared.stall_timeout,
                    &shared.patterns,
                );
                let failure = match verdict {
                    StartupState::Starting => None,
                    StartupState::Failed { reason } => Some((StartupFailureKind::FatalOutput, reason)),
                    StartupState::Stalled { reason } => Some((StartupFailureKind::Stalled, reason)),
                };
                match failure {
                    Some((kind, reason)) => {
                        let failure = StartupFailure {
                            kind,
                            reason,
                            output: state.output.combined(),
                            exit: None,
                        };
                        shared.report_startup_failure(&mut state, failure);
                        true
                    }
                    None => {
                        previous = output;
                        false
                    }
                }
            }
        };
        if finished {
            return;
        }
    }
}

async fn wait_for_exit(
    shared: Arc<Shared>,
    mut child: Child,
    pid: Option<u32>,
    mut force_rx: oneshot::Receiver<()>,
    pumps: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut force_rx => {
            if let Some(pid) = pid {
                send_forced_signal(pid);
            }
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => {
            error!(error = %err, "failed to wait for server process");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    for pump in pumps {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await;
    }

    {
        let mut state = shared.lock();
        state.exit = Some(info);
        state.cancel_classifier();
        if !state.startup_completed && !info.success() {
            let failure = StartupFailure {
                kind: StartupFailureKind::PrematureExit,
                reason: format!("process exited with {} before it was ready", info),
                output: state.output.combined(),
                exit: Some(info),
            };
            shared.report_startup_failure(&mut state, failure);
        } else {
            debug!(pid = pid.unwrap_or(0), %info, "server process exited");
        }
    }
    shared.exit_tx.send_replace(Some(info));
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn send_forced_signal(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    let pid = pid as libc::pid_t;
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_graceful_signal(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest console equivalent of SIGTERM.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(not(unix))]
fn send_forced_signal(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_graceful_signal(_pid: u32) {}
