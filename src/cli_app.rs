//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use backup_storage_guard::alert::event::{AlertEvent, format_bytes};
use backup_storage_guard::alert::notifier::{AlertConfig, AlertNotifier, TransportNotifier};
use backup_storage_guard::core::config::Config;
use backup_storage_guard::core::errors::GuardError;
use backup_storage_guard::guard::executor::RunResult;
use backup_storage_guard::guard::inspector::StorageInspector;
use backup_storage_guard::guard::orchestrator::{
    AlertOutcome, GuardOrchestrator, GuardState, RunMode, RunOutcome,
};
use backup_storage_guard::guard::signals::CancellationSignal;
use backup_storage_guard::guard::threshold::SizeEstimator;
use backup_storage_guard::logger::jsonl::{JsonlConfig, JsonlWriter};
use backup_storage_guard::platform::pal::detect_platform;

/// Backup Storage Guard: never start a backup the backup volume cannot hold.
#[derive(Debug, Parser)]
#[command(
    name = "bsg",
    author,
    version,
    about = "Backup Storage Guard - refuses backups that would overflow the backup volume",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Echo every state transition to stderr.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Inspect, evaluate and, if admitted, run the backup producer.
    Run,
    /// Dry run: inspect and evaluate only. No lock, no producer, no alert.
    Check,
    /// List completed backup artifacts, newest first.
    History(HistoryArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    /// Maximum number of artifacts to list.
    #[arg(long, short = 'n', default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// A guard error outside a run (config loading, history listing).
    #[error("{0}")]
    Guard(#[from] GuardError),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Guard(e) => e.exit_code(),
            Self::Json(_) | Self::Io(_) => 1,
        }
    }
}

/// Dispatch CLI commands. `Ok` carries the process exit code.
pub fn run(cli: &Cli) -> Result<i32, CliError> {
    if cli.no_color || !io::stderr().is_terminal() {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run => run_guard(cli, RunMode::Run),
        Command::Check => run_guard(cli, RunMode::Check),
        Command::History(args) => run_history(cli, args).map(|()| 0),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(0)
        }
    }
}

// ---------------------------------------------------------------------------
// run / check
// ---------------------------------------------------------------------------

fn run_guard(cli: &Cli, mode: RunMode) -> Result<i32, CliError> {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            if mode == RunMode::Run {
                alert_unloadable_config(&e)?;
            }
            return Err(e.into());
        }
    };

    let notifier = TransportNotifier::from_config(&config.alerts);
    let log = JsonlWriter::open(JsonlConfig::for_path(&config.paths.jsonl_log));
    let cancel = CancellationSignal::from_os_signals();
    let mut guard = GuardOrchestrator::new(config, detect_platform(), notifier, log, cancel)
        .with_progress(cli.verbose);

    let outcome = guard.run(mode);
    report_outcome(cli, &outcome)?;
    Ok(outcome.exit_code())
}

/// Without a config there are no alert settings; fall back to the defaults
/// so the operator still hears about it.
fn alert_unloadable_config(error: &GuardError) -> Result<(), CliError> {
    let event = AlertEvent::from_error(error, Utc::now());
    let mut notifier = TransportNotifier::from_config(&AlertConfig::default());
    match notifier.send(&event) {
        Ok(_) => Ok(()),
        Err(notify) => {
            eprintln!("bsg: {error}");
            Err(notify.into())
        }
    }
}

fn report_outcome(cli: &Cli, outcome: &RunOutcome) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&outcome_json(outcome)),
        OutputMode::Human => {
            if !cli.quiet || !outcome.succeeded() {
                eprint!("{}", outcome_human(outcome));
            }
            Ok(())
        }
    }
}

const fn mode_name(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Run => "run",
        RunMode::Check => "check",
    }
}

fn state_label(state: GuardState) -> String {
    let label = state.as_str().to_uppercase();
    match state {
        GuardState::Succeeded | GuardState::Admitted => label.green().bold().to_string(),
        GuardState::Denied => label.yellow().bold().to_string(),
        _ => label.red().bold().to_string(),
    }
}

fn outcome_human(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "bsg {}: {}\n",
        mode_name(outcome.mode),
        state_label(outcome.state)
    ));

    for path in &outcome.swept {
        out.push_str(&format!("  removed stale partial {}\n", path.display()));
    }
    if let Some(snapshot) = &outcome.snapshot {
        out.push_str(&format!(
            "  current usage:   {}\n",
            format_bytes(snapshot.current_used_bytes)
        ));
    }
    if let Some(verdict) = &outcome.verdict {
        out.push_str(&format!(
            "  estimate:        {} ({:?}, {} sample(s))\n",
            format_bytes(verdict.estimate().bytes),
            verdict.estimate().source,
            verdict.estimate().samples
        ));
        out.push_str(&format!(
            "  projected usage: {} / limit {}\n",
            format_bytes(verdict.projected_usage_bytes()),
            format_bytes(verdict.limit_bytes())
        ));
        if let Some(reason) = verdict.deny_reason() {
            out.push_str(&format!("  reason:          {reason}\n"));
        }
    }
    match &outcome.run_result {
        Some(RunResult::Success {
            artifact_path,
            artifact_size_bytes,
            duration_ms,
        }) => out.push_str(&format!(
            "  artifact:        {} ({}, {duration_ms} ms)\n",
            artifact_path.display(),
            format_bytes(*artifact_size_bytes)
        )),
        Some(RunResult::Failure { cause, .. }) => {
            out.push_str(&format!("  failure:         {cause}\n"));
        }
        None => {}
    }
    if let Some(error) = &outcome.error {
        out.push_str(&format!("  error:           {error}\n"));
    }
    match &outcome.alert {
        Some(AlertOutcome::Delivered(receipt)) => {
            out.push_str(&format!(
                "  alert sent via:  {}\n",
                receipt.delivered.join(", ")
            ));
            for (transport, error) in &receipt.failed {
                out.push_str(&format!(
                    "  {} {transport}: {error}\n",
                    "alert failed on:".yellow().bold()
                ));
            }
        }
        Some(AlertOutcome::Failed(e)) => {
            out.push_str(&format!("  {} {e}\n", "alert NOT delivered:".red().bold()));
        }
        None => {}
    }
    out
}

fn outcome_json(outcome: &RunOutcome) -> Value {
    let alert = match &outcome.alert {
        Some(AlertOutcome::Delivered(receipt)) => json!({
            "delivered": true,
            "transports": receipt.delivered,
            "failed": receipt
                .failed
                .iter()
                .map(|(transport, error)| json!({"transport": transport, "error": error}))
                .collect::<Vec<_>>(),
            "attempts": receipt.attempts,
        }),
        Some(AlertOutcome::Failed(e)) => json!({
            "delivered": false,
            "error_code": e.code(),
            "error": e.to_string(),
        }),
        None => Value::Null,
    };
    let error = outcome
        .error
        .as_ref()
        .map(|e| json!({"code": e.code(), "message": e.to_string()}));
    json!({
        "command": mode_name(outcome.mode),
        "state": outcome.state.as_str(),
        "exit_code": outcome.exit_code(),
        "snapshot": outcome.snapshot,
        "verdict": outcome.verdict,
        "run_result": outcome.run_result,
        "error": error,
        "alert": alert,
        "swept": outcome.swept,
    })
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let inspector = StorageInspector::new(detect_platform(), &config.history);
    let artifacts = inspector.list_artifacts()?;

    let window: Vec<u64> = artifacts
        .iter()
        .take(config.history.window)
        .map(|a| a.size_bytes)
        .collect();
    let estimate = SizeEstimator::new(
        config.history.estimate,
        config.history.default_estimate_bytes,
    )
    .estimate(&window);

    match output_mode(cli) {
        OutputMode::Human => {
            println!("History: {}", config.history.dir.display());
            if artifacts.is_empty() {
                println!("  (no completed backups yet)");
            }
            for (i, artifact) in artifacts.iter().take(args.limit).enumerate() {
                let marker = if i < config.history.window { "*" } else { " " };
                let name = artifact
                    .path
                    .file_name()
                    .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
                println!(
                    "{marker} {}  {:>10}  {name}",
                    artifact.modified.format("%Y-%m-%d %H:%M:%SZ"),
                    format_bytes(artifact.size_bytes),
                );
            }
            println!(
                "Next estimate: {} ({} policy, {:?}; * = in window of {})",
                format_bytes(estimate.bytes),
                config.history.estimate,
                estimate.source,
                config.history.window
            );
        }
        OutputMode::Json => {
            let listed: Vec<_> = artifacts.iter().take(args.limit).collect();
            let payload = json!({
                "command": "history",
                "dir": config.history.dir.to_string_lossy(),
                "total": artifacts.len(),
                "artifacts": listed,
                "window": config.history.window,
                "estimate": estimate,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<i32, CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(0)
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?.redacted();

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config).map_err(|e| {
                        GuardError::Serialization {
                            context: "config show",
                            details: e.to_string(),
                        }
                    })?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(0)
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let runnable = config.executor.ensure_runnable();

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                        println!(
                            "  Ceiling: {}",
                            config
                                .limits
                                .ceiling_bytes()
                                .map_or_else(|| "n/a".to_string(), format_bytes)
                        );
                        if let Err(e) = &runnable {
                            println!("  Note: {e} (required for `bsg run`)");
                        }
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "runnable": runnable.is_ok(),
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                            "ceiling_bytes": config.limits.ceiling_bytes(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(0)
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error_code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(e.exit_code())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("BSG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
