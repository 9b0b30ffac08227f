#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_bsg") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "bsg.exe" } else { "bsg" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve bsg binary path for integration test"),
    }
}

/// A `bsg` command isolated from the caller's environment: `HOME` points into
/// `home` and no `BSG_*` override leaks in.
pub fn bsg_command(home: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(resolve_bin_path());
    command
        .args(args)
        .env("HOME", home)
        .env("RUST_BACKTRACE", "1")
        .env("NO_COLOR", "1");
    for (name, _) in std::env::vars() {
        if name.starts_with("BSG_") {
            command.env_remove(name);
        }
    }
    command
}

/// Start `bsg` without waiting for it.
pub fn spawn_cli(home: &Path, args: &[&str]) -> Child {
    bsg_command(home, args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn bsg command")
}

pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, home, args, &[])
}

pub fn run_cli_case_with_env(
    case_name: &str,
    home: &Path,
    args: &[&str],
    env: &[(&str, &str)],
) -> CmdResult {
    let mut command = bsg_command(home, args);
    for (name, value) in env {
        command.env(name, value);
    }
    let output = command.output().expect("execute bsg command");
    record_case(case_name, args, output.status, &output.stdout, &output.stderr)
}

/// Write the case transcript to the shared test log directory.
pub fn record_case(
    case_name: &str,
    args: &[&str],
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> CmdResult {
    let root = std::env::temp_dir().join("bsg-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");
    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));

    let stdout = String::from_utf8_lossy(stdout).to_string();
    let stderr = String::from_utf8_lossy(stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", resolve_bin_path().display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={status}\n"));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status,
        stdout,
        stderr,
        log_path,
    }
}

/// A self-contained guard installation inside a temp dir.
///
/// Limits are the documented defaults scaled down by 1e6 (budget 20_000,
/// margin 500, fraction 0.9 → ceiling 17_550) and usage is measured from the
/// history directory, so tests control both sides of the comparison.
pub struct GuardFixture {
    pub root: tempfile::TempDir,
    pub config_path: PathBuf,
    pub history_dir: PathBuf,
    pub alerts_path: PathBuf,
    pub log_path: PathBuf,
    pub lock_path: PathBuf,
}

impl GuardFixture {
    pub fn new(producer_script: &str) -> Self {
        Self::with_timeout(producer_script, 20)
    }

    pub fn with_timeout(producer_script: &str, timeout_secs: u64) -> Self {
        let root = tempfile::tempdir().expect("create fixture dir");
        let history_dir = root.path().join("backups");
        let alerts_path = root.path().join("state").join("alerts.jsonl");
        let log_path = root.path().join("state").join("transitions.jsonl");
        let lock_path = root.path().join("state").join("guard.lock");
        let config_path = root.path().join("bsg.toml");

        let config = format!(
            r#"[limits]
total_budget_bytes = 20000
safety_margin_bytes = 500
abort_fraction = 0.9

[history]
dir = {history:?}
window = 5
default_estimate_bytes = 100
usage_source = "history"
artifact_prefix = "backup-"
artifact_suffix = ".tar"

[executor]
command = ["/bin/sh", "-c", {script:?}]
timeout_secs = {timeout_secs}

[alerts]
channels = ["file"]
max_attempts = 2
backoff_ms = 10

[alerts.file]
path = {alerts:?}

[paths]
lock_file = {lock:?}
jsonl_log = {log:?}
"#,
            history = history_dir.display().to_string(),
            script = producer_script,
            alerts = alerts_path.display().to_string(),
            lock = lock_path.display().to_string(),
            log = log_path.display().to_string(),
        );
        fs::write(&config_path, config).expect("write fixture config");

        Self {
            root,
            config_path,
            history_dir,
            alerts_path,
            log_path,
            lock_path,
        }
    }

    pub fn home(&self) -> &Path {
        self.root.path()
    }

    pub fn config_arg(&self) -> String {
        self.config_path.display().to_string()
    }

    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        self.run_with_env(case_name, args, &[])
    }

    /// Piped stdout defaults to JSON; human-output cases force it back.
    pub fn run_human(&self, case_name: &str, args: &[&str]) -> CmdResult {
        self.run_with_env(case_name, args, &[("BSG_OUTPUT_FORMAT", "human")])
    }

    pub fn run_with_env(&self, case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
        let config = self.config_arg();
        let mut full = vec!["--config", config.as_str()];
        full.extend_from_slice(args);
        run_cli_case_with_env(case_name, self.home(), &full, env)
    }

    /// Put a completed artifact of `size` bytes into the history.
    pub fn seed_artifact(&self, name: &str, size: usize) -> PathBuf {
        fs::create_dir_all(&self.history_dir).expect("create history dir");
        let path = self.history_dir.join(name);
        fs::write(&path, vec![0_u8; size]).expect("write artifact");
        path
    }

    pub fn history_entries(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.history_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn alerts(&self) -> Vec<serde_json::Value> {
        read_jsonl(&self.alerts_path)
    }

    pub fn transitions(&self) -> Vec<serde_json::Value> {
        read_jsonl(&self.log_path)
    }
}

pub fn read_jsonl(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("valid JSONL line"))
        .collect()
}
