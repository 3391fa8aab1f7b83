//! Top-level run sequence.
//!
//! A run moves through `PortPrecheck → Launching → AwaitingReadiness →
//! RunningVerification → Teardown | KeptAlive`, skipping the stages that are not
//! configured. Every wait races the server's startup-failure report, and every
//! failure after launch stops the server before it is returned.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::events::ExitInfo;
use crate::output::{tail_lines, OutputSink};
use crate::process::LaunchSpec;
use crate::readiness::{
    port_available, wait_for_port_to_become_unavailable, wait_for_url, ReadinessConfig,
    ReadinessTarget,
};
use crate::supervisor::{launch, KillOutcome, ServerHandle, SignalGuard};

const FAILURE_OUTPUT_LINES: usize = 20;

/// Stages of a run, in the order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    PortPrecheck,
    Launching,
    AwaitingReadiness,
    RunningVerification,
    Teardown,
    KeptAlive,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::PortPrecheck => "port precheck",
            RunStage::Launching => "launch",
            RunStage::AwaitingReadiness => "readiness",
            RunStage::RunningVerification => "verification",
            RunStage::Teardown => "teardown",
            RunStage::KeptAlive => "keep-alive",
        };
        f.write_str(name)
    }
}

/// Everything a run needs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub launch: LaunchSpec,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub readiness: ReadinessConfig,
    /// Verification command, parsed with shell quoting rules.
    pub run_command: Option<String>,
    pub keep_alive: bool,
    /// Install SIGINT/SIGTERM handlers that stop the server.
    pub handle_signals: bool,
}

impl RunOptions {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            port: None,
            url: None,
            readiness: ReadinessConfig::default(),
            run_command: None,
            keep_alive: false,
            handle_signals: false,
        }
    }
}

/// Output of the verification command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A server left running by a keep-alive run.
#[derive(Debug)]
pub struct KeptAlive {
    pub handle: ServerHandle,
    /// Signal registration that keeps stopping the server on SIGINT/SIGTERM.
    pub signals: Option<SignalGuard>,
}

impl KeptAlive {
    /// Waits for the server to exit on its own.
    ///
    /// A startup failure reported along the way (for example a crash before
    /// any readiness check confirmed the server) is returned as an error.
    pub async fn wait(&self) -> Result<Option<ExitInfo>, SupervisorError> {
        let exit = self.handle.wait_exit().await;
        match self.handle.reported_failure() {
            Some(failure) => Err(failure.into()),
            None => Ok(exit),
        }
    }
}

/// Successful run.
#[derive(Debug)]
pub struct RunReport {
    pub stages: Vec<RunStage>,
    pub verification: Option<RunResult>,
    pub kept_alive: Option<KeptAlive>,
}

/// Failed run.
#[derive(Debug)]
pub struct RunFailure {
    /// Stage the run was in when it failed.
    pub stage: RunStage,
    pub error: SupervisorError,
    pub stages: Vec<RunStage>,
    pub verification: Option<RunResult>,
    /// The launched server, if the run got that far.
    pub server: Option<ServerHandle>,
}

impl RunFailure {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// Drives one supervised run.
pub struct Orchestrator {
    options: RunOptions,
    sink: Arc<dyn OutputSink>,
    stages: Vec<RunStage>,
    verification: Option<RunResult>,
}

impl Orchestrator {
    pub fn new(options: RunOptions, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            options,
            sink,
            stages: Vec::new(),
            verification: None,
        }
    }

    /// Runs all configured stages.
    pub async fn run(mut self) -> Result<RunReport, RunFailure> {
        if let Some(port) = self.options.port {
            self.enter(RunStage::PortPrecheck);
            match port_available(port).await {
                Ok(true) => info!(port, "port is free"),
                Ok(false) => {
                    return Err(self.fail(None, SupervisorError::PortUnavailable { port }));
                }
                Err(err) => return Err(self.fail(None, err.into())),
            }
        }

        self.enter(RunStage::Launching);
        let handle = match launch(self.options.launch.clone(), self.sink.clone()) {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail(None, err)),
        };
        let signals = self
            .options
            .handle_signals
            .then(|| handle.install_signal_handlers());

        if let Some(failure) = handle.reported_failure() {
            return Err(self.abort(handle, failure.into()).await);
        }

        if self.options.port.is_some() || self.options.url.is_some() {
            self.enter(RunStage::AwaitingReadiness);
            let ready: Result<(), SupervisorError> = tokio::select! {
                biased;
                failure = handle.startup_failure() => Err(failure.into()),
                ready = self.await_readiness() => ready,
            };
            if let Err(err) = ready.and_then(|()| confirm_ready(&handle)) {
                return Err(self.abort(handle, err).await);
            }
        } else {
            debug!("no port or url configured, skipping readiness wait");
        }

        if let Some(command) = self.options.run_command.clone() {
            self.enter(RunStage::RunningVerification);
            let outcome: Result<RunResult, SupervisorError> = tokio::select! {
                biased;
                failure = handle.startup_failure() => Err(failure.into()),
                result = run_verification(
                    &command,
                    &self.options.launch.env,
                    self.options.readiness.timeout,
                ) => result,
            };
            let result = match outcome {
                Ok(result) => result,
                Err(err) => return Err(self.abort(handle, err).await),
            };
            let code = result.exit_code;
            self.verification = Some(result);
            if code != 0 {
                let err = SupervisorError::VerificationFailed { code };
                return Err(self.abort(handle, err).await);
            }
        }

        self.finish(handle, signals).await
    }

    /// Tears the server down or keeps it alive, unless it already failed.
    async fn finish(
        mut self,
        handle: ServerHandle,
        signals: Option<SignalGuard>,
    ) -> Result<RunReport, RunFailure> {
        if let Some(failure) = handle.reported_failure() {
            return Err(self.abort(handle, failure.into()).await);
        }

        if self.options.keep_alive {
            self.enter(RunStage::KeptAlive);
            info!(pid = handle.pid().unwrap_or(0), "keeping server alive");
            return Ok(RunReport {
                stages: self.stages,
                verification: self.verification,
                kept_alive: Some(KeptAlive { handle, signals }),
            });
        }

        self.enter(RunStage::Teardown);
        match handle.kill().await {
            Ok(KillOutcome::AlreadyStopped) => {
                // The exit may have been recorded as a failure while we were
                // getting here.
                if let Some(failure) = handle.reported_failure() {
                    return Err(self.fail(Some(handle), failure.into()));
                }
                info!("server had already stopped");
            }
            Ok(outcome) => info!(?outcome, "server stopped"),
            Err(err) => return Err(self.fail(Some(handle), err)),
        }
        drop(signals);
        Ok(RunReport {
            stages: self.stages,
            verification: self.verification,
            kept_alive: None,
        })
    }

    fn enter(&mut self, stage: RunStage) {
        debug!(%stage, "entering stage");
        self.stages.push(stage);
    }

    fn current_stage(&self) -> RunStage {
        self.stages.last().copied().unwrap_or(RunStage::PortPrecheck)
    }

    async fn await_readiness(&self) -> Result<(), SupervisorError> {
        let config = self.options.readiness;
        let timeout_ms = config.timeout.as_millis() as u64;

        if let Some(url) = &self.options.url {
            let target = ReadinessTarget::Url { url: url.clone() };
            info!(target = %target.describe(), timeout_ms, "waiting for server");
            match wait_for_url(url, config).await {
                Ok(true) => {
                    info!(target = %target.describe(), "server is ready");
                    return Ok(());
                }
                Ok(false) => {
                    return Err(SupervisorError::ReadinessTimeout {
                        target: target.describe(),
                        timeout_ms,
                    });
                }
                Err(err) => match self.options.port {
                    Some(port) => {
                        warn!(error = %err, port, "url check failed, falling back to port check");
                    }
                    None => return Err(err.into()),
                },
            }
        }

        let Some(port) = self.options.port else {
            return Ok(());
        };
        let target = ReadinessTarget::Port { number: port };
        info!(target = %target.describe(), timeout_ms, "waiting for server");
        match wait_for_port_to_become_unavailable(port, config).await {
            Ok(true) => {
                info!(target = %target.describe(), "server is ready");
                Ok(())
            }
            Ok(false) => Err(SupervisorError::ReadinessTimeout {
                target: target.describe(),
                timeout_ms,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Stops the server unless keep-alive was requested, then records the failure.
    async fn abort(&self, handle: ServerHandle, error: SupervisorError) -> RunFailure {
        if self.options.keep_alive {
            warn!(
                pid = handle.pid().unwrap_or(0),
                "keep-alive requested, leaving server running"
            );
        } else if let Err(kill_err) = handle.kill().await {
            warn!(error = %kill_err, "failed to stop server after failure");
        }
        self.fail(Some(handle), error)
    }

    fn fail(&self, server: Option<ServerHandle>, error: SupervisorError) -> RunFailure {
        let stage = self.current_stage();
        error!(%stage, error = %error, "run failed");
        if let Some(output) = error.startup_output() {
            if !output.is_empty() {
                warn!(
                    "last startup output:\n{}",
                    tail_lines(output, FAILURE_OUTPUT_LINES)
                );
                debug!("full startup output:\n{}", output);
            }
        }
        RunFailure {
            stage,
            error,
            stages: self.stages.clone(),
            verification: self.verification.clone(),
            server,
        }
    }
}

/// Marks startup complete, unless a startup failure won the race.
fn confirm_ready(handle: &ServerHandle) -> Result<(), SupervisorError> {
    if handle.mark_startup_completed() {
        info!(
            command = handle.command(),
            uptime_ms = handle.uptime().as_millis() as u64,
            "server startup confirmed"
        );
        return Ok(());
    }
    match handle.reported_failure() {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

/// Runs the verification command and captures its output.
///
/// The command inherits this process's environment with `env` layered on top.
/// The child is killed if it outlives `timeout`.
pub async fn run_verification(
    command: &str,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<RunResult, SupervisorError> {
    let mut parts =
        shell_words::split(command).map_err(|err| SupervisorError::VerificationSpawn {
            command: command.to_string(),
            reason: err.to_string(),
        })?;
    if parts.is_empty() {
        return Err(SupervisorError::VerificationSpawn {
            command: command.to_string(),
            reason: "empty command".to_string(),
        });
    }
    let program = parts.remove(0);

    info!(command, "running verification command");
    let mut cmd = Command::new(&program);
    cmd.args(&parts)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .map_err(|err| SupervisorError::VerificationSpawn {
            command: command.to_string(),
            reason: err.to_string(),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(SupervisorError::VerificationSpawn {
                command: command.to_string(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(SupervisorError::VerificationTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    let result = RunResult {
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    if !result.stdout.is_empty() {
        info!("verification stdout:\n{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        info!("verification stderr:\n{}", result.stderr.trim_end());
    }
    info!(exit_code = result.exit_code, "verification command finished");
    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::output::NullSink;

    fn sh(script: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new("sh").args(["-c", script]);
        spec.tick_interval = Duration::from_millis(20);
        spec.kill_grace = Duration::from_millis(500);
        spec
    }

    fn options(spec: LaunchSpec, timeout_ms: u64) -> RunOptions {
        let mut options = RunOptions::new(spec);
        options.readiness = ReadinessConfig {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(20),
        };
        options
    }

    async fn run(options: RunOptions) -> Result<RunReport, RunFailure> {
        tokio::time::timeout(
            Duration::from_secs(15),
            Orchestrator::new(options, Arc::new(NullSink)).run(),
        )
        .await
        .expect("run timed out")
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn serve_ok() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        port
    }

    fn assert_stopped(failure: &RunFailure) {
        let server = failure.server.as_ref().expect("server was launched");
        assert!(server.exit_info().is_some());
        assert!(server.is_startup_completed());
    }

    #[tokio::test]
    async fn occupied_port_fails_before_launch() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut opts = options(sh("sleep 30"), 1_000);
        opts.port = Some(port);
        let failure = run(opts).await.unwrap_err();
        assert!(matches!(failure.error, SupervisorError::PortUnavailable { .. }));
        assert_eq!(failure.exit_code(), 1);
        assert_eq!(failure.stages, vec![RunStage::PortPrecheck]);
        assert!(failure.server.is_none());
    }

    #[tokio::test]
    async fn quick_clean_exit_without_readiness_tears_down() {
        let report = run(options(sh("exit 0"), 1_000)).await.unwrap();
        assert_eq!(report.stages, vec![RunStage::Launching, RunStage::Teardown]);
        assert!(report.verification.is_none());
        assert!(report.kept_alive.is_none());
    }

    #[tokio::test]
    async fn readiness_timeout_kills_server() {
        let mut opts = options(sh("sleep 30"), 200);
        opts.port = Some(free_port().await);
        let failure = run(opts).await.unwrap_err();
        assert!(matches!(failure.error, SupervisorError::ReadinessTimeout { .. }));
        assert_eq!(failure.stage, RunStage::AwaitingReadiness);
        assert_ne!(failure.exit_code(), 0);
        assert_stopped(&failure);
    }

    #[tokio::test]
    async fn fatal_output_fails_startup() {
        let mut opts = options(sh("echo 'Error: Cannot find module express'; sleep 30"), 10_000);
        opts.port = Some(free_port().await);
        let failure = run(opts).await.unwrap_err();
        match &failure.error {
            SupervisorError::StartupFailed { reason, output, .. } => {
                assert_eq!(reason, "Missing module");
                assert!(output.contains("Cannot find module"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(failure.exit_code(), 1);
        assert!(!failure.stages.contains(&RunStage::RunningVerification));
        assert_stopped(&failure);
    }

    #[tokio::test]
    async fn premature_exit_uses_server_exit_code() {
        let mut opts = options(sh("echo booting; exit 5"), 10_000);
        opts.port = Some(free_port().await);
        let failure = run(opts).await.unwrap_err();
        assert!(matches!(failure.error, SupervisorError::StartupFailed { .. }));
        assert_eq!(failure.exit_code(), 5);
    }

    #[tokio::test]
    async fn url_readiness_then_verification() {
        let http_port = serve_ok().await;
        let mut env = HashMap::new();
        env.insert("SERVERWATCH_MODE".to_string(), "ci".to_string());
        let mut opts = options(sh("sleep 30").env(env), 5_000);
        opts.url = Some(format!("http://127.0.0.1:{}/health", http_port));
        opts.run_command =
            Some("sh -c 'test \"$SERVERWATCH_MODE\" = ci && echo verified'".to_string());
        let report = run(opts).await.unwrap();
        assert_eq!(
            report.stages,
            vec![
                RunStage::Launching,
                RunStage::AwaitingReadiness,
                RunStage::RunningVerification,
                RunStage::Teardown,
            ]
        );
        let verification = report.verification.unwrap();
        assert_eq!(verification.exit_code, 0);
        assert_eq!(verification.stdout, "verified\n");
    }

    #[tokio::test]
    async fn failed_verification_propagates_exit_code() {
        let http_port = serve_ok().await;
        let mut opts = options(sh("sleep 30"), 5_000);
        opts.url = Some(format!("http://127.0.0.1:{}/", http_port));
        opts.run_command = Some("sh -c 'echo nope 1>&2; exit 7'".to_string());
        let failure = run(opts).await.unwrap_err();
        assert_eq!(failure.exit_code(), 7);
        assert_eq!(failure.stage, RunStage::RunningVerification);
        assert_eq!(failure.verification.as_ref().unwrap().stderr, "nope\n");
        assert_stopped(&failure);
    }

    #[tokio::test]
    async fn invalid_url_falls_back_to_port() {
        let port = free_port().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            // The readiness probe briefly binds the same port while polling.
            let listener = loop {
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => break listener,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(listener);
        });
        let mut opts = options(sh("sleep 30"), 5_000);
        opts.url = Some("not a url".to_string());
        opts.port = Some(port);
        let report = run(opts).await.unwrap();
        assert_eq!(
            report.stages,
            vec![
                RunStage::PortPrecheck,
                RunStage::Launching,
                RunStage::AwaitingReadiness,
                RunStage::Teardown,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_url_without_port_fails() {
        let mut opts = options(sh("sleep 30"), 5_000);
        opts.url = Some("localhost:3000".to_string());
        let failure = run(opts).await.unwrap_err();
        assert!(matches!(failure.error, SupervisorError::Readiness(_)));
        assert_eq!(failure.exit_code(), 1);
        assert_stopped(&failure);
    }

    #[tokio::test]
    async fn keep_alive_leaves_server_running() {
        let mut opts = options(sh("sleep 30"), 1_000);
        opts.keep_alive = true;
        let report = run(opts).await.unwrap();
        assert_eq!(report.stages, vec![RunStage::Launching, RunStage::KeptAlive]);
        let kept = report.kept_alive.unwrap();
        assert!(kept.handle.exit_info().is_none());
        assert!(kept.signals.is_none());
        assert_eq!(kept.handle.kill().await.unwrap(), KillOutcome::Graceful);
    }

    #[tokio::test]
    async fn keep_alive_failure_leaves_server_running() {
        let http_port = serve_ok().await;
        let mut opts = options(sh("sleep 30"), 5_000);
        opts.url = Some(format!("http://127.0.0.1:{}/", http_port));
        opts.run_command = Some("sh -c 'exit 2'".to_string());
        opts.keep_alive = true;
        let failure = run(opts).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        let server = failure.server.expect("server was launched");
        assert!(server.exit_info().is_none());
        assert!(!server.is_killed());
        assert_eq!(server.kill().await.unwrap(), KillOutcome::Graceful);
    }

    async fn failed_handle(script: &str) -> ServerHandle {
        let handle = launch(sh(script), Arc::new(NullSink)).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle.startup_failure())
            .await
            .expect("no startup failure");
        handle
    }

    #[tokio::test]
    async fn reported_failure_beats_later_readiness() {
        let handle = failed_handle("exit 3").await;
        let err = confirm_ready(&handle).unwrap_err();
        assert!(matches!(err, SupervisorError::StartupFailed { .. }));
        assert_eq!(err.exit_code(), 3);
        assert!(handle.reported_failure().is_some());
    }

    #[tokio::test]
    async fn teardown_reports_failure_recorded_before_it() {
        let handle = failed_handle("echo boom; exit 3").await;
        let mut orchestrator = Orchestrator::new(options(sh("exit 3"), 1_000), Arc::new(NullSink));
        orchestrator.enter(RunStage::Launching);
        let failure = orchestrator.finish(handle, None).await.unwrap_err();
        assert_eq!(failure.exit_code(), 3);
        assert_eq!(failure.stage, RunStage::Launching);
        assert!(!failure.stages.contains(&RunStage::Teardown));
        assert_eq!(failure.error.startup_output(), Some("boom\n"));
    }

    #[tokio::test]
    async fn crash_during_verification_fails_run() {
        let mut opts = options(sh("exit 3"), 5_000);
        opts.run_command = Some("sh -c 'sleep 0.5'".to_string());
        let failure = run(opts).await.unwrap_err();
        assert_eq!(failure.stage, RunStage::RunningVerification);
        assert_eq!(failure.exit_code(), 3);
        assert!(failure.verification.is_none());
    }

    #[tokio::test]
    async fn kept_alive_crash_reports_server_exit_code() {
        let mut opts = options(sh("echo boom; sleep 0.3; exit 3"), 1_000);
        opts.keep_alive = true;
        let report = run(opts).await.unwrap();
        let kept = report.kept_alive.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), kept.wait())
            .await
            .expect("server did not exit")
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn kept_alive_clean_exit_is_ok() {
        let mut opts = options(sh("sleep 0.2"), 1_000);
        opts.keep_alive = true;
        let report = run(opts).await.unwrap();
        let kept = report.kept_alive.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), kept.wait())
            .await
            .expect("server did not exit")
            .unwrap();
        assert!(exit.unwrap().success());
    }

    #[tokio::test]
    async fn verification_timeout_is_reported() {
        let err = run_verification("sleep 5", &HashMap::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::VerificationTimeout { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn verification_parse_errors_are_reported() {
        let err = run_verification("sh -c 'unterminated", &HashMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::VerificationSpawn { .. }));
    }
}
