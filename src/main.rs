//! Serverwatch: start a development server, wait until it is ready, run a
//! verification command against it, then shut it down.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with the optional configuration file, and hands the
//! result to the orchestrator.

mod classifier;
mod config;
mod env_spec;
mod error;
mod events;
mod orchestrator;
mod output;
mod process;
mod readiness;
mod supervisor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::classifier::ErrorPattern;
use crate::config::Config;
use crate::env_spec::parse_env;
use crate::orchestrator::{Orchestrator, RunOptions, RunStage};
use crate::output::ConsoleSink;
use crate::process::{LaunchSpec, DEFAULT_KILL_GRACE, DEFAULT_STALL_TIMEOUT};
use crate::readiness::ReadinessConfig;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "serverwatch",
    version,
    about = "Start a server, wait for it to be ready, verify it, shut it down",
    styles = help_styles(),
    color = clap::ColorChoice::Always
)]
struct Cli {
    /// Server start command (split on whitespace).
    command: Option<String>,
    /// Extra arguments appended to the server command.
    #[arg(last = true)]
    args: Vec<String>,
    /// Port to pre-check and wait on.
    #[arg(long)]
    port: Option<u16>,
    /// URL to poll until it answers with a 2xx or 3xx status.
    #[arg(long)]
    url: Option<String>,
    /// Readiness timeout in milliseconds (also bounds the verification command).
    #[arg(long)]
    timeout: Option<u64>,
    /// Readiness poll interval in milliseconds.
    #[arg(long)]
    interval: Option<u64>,
    /// Fail startup after this many milliseconds without new output.
    #[arg(long)]
    stall_timeout: Option<u64>,
    /// Environment for the server, as KEY=VALUE,KEY=VALUE (repeatable).
    #[arg(long)]
    env: Vec<String>,
    /// Verification command to run once the server is ready.
    #[arg(long)]
    run: Option<String>,
    /// Leave the server running instead of stopping it.
    #[arg(long)]
    keep_alive: bool,
    /// Milliseconds to wait after the graceful stop before forcing it.
    #[arg(long)]
    kill_grace: Option<u64>,
    /// Path to serverwatch.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any serverwatch.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(&cli)?;
    let options = settings.into_options();
    info!(command = %options.launch.display_command(), "starting server");

    let result = Orchestrator::new(options, Arc::new(ConsoleSink)).run().await;
    match result {
        Ok(report) => {
            debug!(stages = %format_stages(&report.stages), "run finished");
            if let Some(verification) = &report.verification {
                info!(exit_code = verification.exit_code, "verification passed");
            }
            if let Some(kept) = report.kept_alive {
                info!("server kept alive, press Ctrl-C to stop it");
                match kept.wait().await {
                    Ok(Some(exit)) => info!(%exit, "server exited"),
                    Ok(None) => {}
                    Err(err) => {
                        let code = err.exit_code();
                        error!(error = %err, exit_code = code, "kept-alive server failed");
                        std::process::exit(code);
                    }
                }
                drop(kept.signals);
            }
            info!("done");
            Ok(())
        }
        Err(failure) => {
            let code = failure.exit_code();
            debug!(stages = %format_stages(&failure.stages), "run aborted");
            if let Some(verification) = &failure.verification {
                if !verification.stderr.is_empty() {
                    error!("verification stderr:\n{}", verification.stderr.trim_end());
                }
            }
            if let Some(exit) = failure.server.as_ref().and_then(|server| server.exit_info()) {
                info!(%exit, "server exit status");
            }
            error!(stage = %failure.stage, exit_code = code, "serverwatch failed");
            std::process::exit(code);
        }
    }
}

fn format_stages(stages: &[RunStage]) -> String {
    stages
        .iter()
        .map(RunStage::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<RunSettings> {
    let mut config = Config::default();
    if !cli.no_config {
        let config_path = cli.config.clone().or_else(default_config_path);
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
        }
    }
    RunSettings::from_cli(cli, config)
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("serverwatch.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    command: String,
    args: Vec<String>,
    port: Option<u16>,
    url: Option<String>,
    timeout_ms: u64,
    interval_ms: u64,
    stall_timeout_ms: u64,
    kill_grace_ms: u64,
    run: Option<String>,
    keep_alive: bool,
    env: HashMap<String, String>,
    error_patterns: Vec<ErrorPattern>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: Config) -> Result<Self> {
        let error_patterns = config.build_error_patterns()?;
        let Some(command) = cli
            .command
            .clone()
            .or(config.command)
            .filter(|command| !command.trim().is_empty())
        else {
            bail!("no server command given (pass <COMMAND> or set `command` in serverwatch.toml)");
        };

        let mut env = config.env.unwrap_or_default();
        for spec in &cli.env {
            env.extend(parse_env(spec));
        }

        Ok(Self {
            command,
            args: cli.args.clone(),
            port: cli.port.or(config.port),
            url: cli.url.clone().or(config.url),
            timeout_ms: cli
                .timeout
                .or(config.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            interval_ms: cli
                .interval
                .or(config.interval_ms)
                .unwrap_or(DEFAULT_INTERVAL_MS),
            stall_timeout_ms: cli
                .stall_timeout
                .or(config.stall_timeout_ms)
                .unwrap_or(DEFAULT_STALL_TIMEOUT.as_millis() as u64),
            kill_grace_ms: cli
                .kill_grace
                .or(config.kill_grace_ms)
                .unwrap_or(DEFAULT_KILL_GRACE.as_millis() as u64),
            run: cli.run.clone().or(config.run),
            keep_alive: cli.keep_alive || config.keep_alive.unwrap_or(false),
            env,
            error_patterns,
        })
    }

    fn into_options(self) -> RunOptions {
        let mut launch = LaunchSpec::new(self.command)
            .args(self.args)
            .env(self.env);
        launch.stall_timeout = Duration::from_millis(self.stall_timeout_ms);
        launch.kill_grace = Duration::from_millis(self.kill_grace_ms);
        launch.error_patterns = self.error_patterns;

        let mut options = RunOptions::new(launch);
        options.port = self.port;
        options.url = self.url;
        options.readiness = ReadinessConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            interval: Duration::from_millis(self.interval_ms),
        };
        options.run_command = self.run;
        options.keep_alive = self.keep_alive;
        options.handle_signals = true;
        options
    }
}
