//! CLI surface tests: parsing, config commands, check mode and history.

mod common;

use std::fs;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use common::{GuardFixture, run_cli_case};

const WRITE_OK: &str = r#"printf 'payload' > "$BSG_ARTIFACT_PATH""#;

#[test]
fn help_lists_commands() {
    let home = tempfile::tempdir().expect("tempdir");
    let result = run_cli_case("help_lists_commands", home.path(), &["--help"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    for command in ["run", "check", "history", "config", "completions"] {
        assert!(
            result.stdout.contains(command),
            "missing {command}; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn no_arguments_prints_usage_and_fails() {
    let home = tempfile::tempdir().expect("tempdir");
    let result = run_cli_case("no_arguments", home.path(), &[]);
    assert_eq!(result.code(), Some(2), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("Usage"));
}

#[test]
fn version_flag_reports_crate_version() {
    let home = tempfile::tempdir().expect("tempdir");
    let result = run_cli_case("version_flag", home.path(), &["--version"]);
    assert_eq!(result.code(), Some(0));
    assert!(result.stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn completions_generate_script() {
    let home = tempfile::tempdir().expect("tempdir");
    let result = run_cli_case("completions_bash", home.path(), &["completions", "bash"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("bsg"));
}

#[test]
fn verbose_and_quiet_conflict() {
    let home = tempfile::tempdir().expect("tempdir");
    let result = run_cli_case("verbose_quiet", home.path(), &["-v", "-q", "check"]);
    assert_eq!(result.code(), Some(2));
}

#[test]
fn config_path_json_reports_existence() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run("config_path_json", &["--json", "config", "path"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["exists"], true);
    assert_eq!(payload["path"], fx.config_arg());
}

#[test]
fn config_validate_accepts_fixture() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run("config_validate_ok", &["config", "validate"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
}

#[test]
fn config_validate_rejects_bad_fraction() {
    let home = tempfile::tempdir().expect("tempdir");
    let path = home.path().join("bad.toml");
    fs::write(&path, "[limits]\nabort_fraction = 1.5\n").expect("write config");
    let config = path.display().to_string();
    let result = run_cli_case(
        "config_validate_bad_fraction",
        home.path(),
        &["--config", &config, "config", "validate"],
    );
    assert_eq!(result.code(), Some(11), "log: {}", result.log_path.display());
}

#[test]
fn config_show_json_includes_limits() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run("config_show_json", &["--json", "config", "show"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("total_budget_bytes"));
    assert!(result.stdout.contains("20000"));
}

#[test]
fn config_show_masks_producer_credentials() {
    let fx = GuardFixture::new(WRITE_OK);
    let mut raw = fs::read_to_string(&fx.config_path).expect("read config");
    raw.push_str(
        "\n[executor.env]\nPGPASSWORD = \"hunter2-db-pass\"\nPGHOST = \"db.internal\"\n",
    );
    fs::write(&fx.config_path, raw).expect("rewrite config");

    for (case, args) in [
        ("config_show_masked_json", vec!["--json", "config", "show"]),
        ("config_show_masked_human", vec!["config", "show"]),
    ] {
        let result = fx.run_human(case, &args);
        assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
        assert!(!result.stdout.contains("hunter2-db-pass"), "{}", result.stdout);
        assert!(result.stdout.contains("[REDACTED]"), "{}", result.stdout);
        assert!(result.stdout.contains("db.internal"), "{}", result.stdout);
    }
}

#[test]
fn missing_explicit_config_is_a_config_error() {
    let home = tempfile::tempdir().expect("tempdir");
    let missing = home.path().join("nope.toml").display().to_string();
    let result = run_cli_case(
        "missing_config_check",
        home.path(),
        &["--config", &missing, "check"],
    );
    assert_eq!(result.code(), Some(11), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("BSG-"));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let home = tempfile::tempdir().expect("tempdir");
    let path = home.path().join("broken.toml");
    fs::write(&path, "[limits\ntotal_budget_bytes = ").expect("write config");
    let config = path.display().to_string();
    let result = run_cli_case(
        "malformed_config",
        home.path(),
        &["--config", &config, "check"],
    );
    assert_eq!(result.code(), Some(11), "log: {}", result.log_path.display());
}

// ──────────────────── check ────────────────────

#[test]
fn check_admits_first_run_with_default_estimate() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run("check_first_run", &["--json", "check"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());

    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["command"], "check");
    assert_eq!(payload["state"], "admitted");
    assert_eq!(payload["verdict"]["verdict"], "admit");
    assert_eq!(payload["verdict"]["limit_bytes"], 17_550);
    assert_eq!(payload["verdict"]["estimate"]["source"], "default");
    assert_eq!(payload["verdict"]["projected_usage_bytes"], 100);
    assert!(payload["run_result"].is_null());
}

#[test]
fn check_has_no_side_effects() {
    let fx = GuardFixture::new("touch \"$HOME/producer-ran\"");
    fx.seed_artifact("backup-a.tar", 7_000);
    fx.seed_artifact("backup-b.tar", 4_000);

    let result = fx.run("check_denied", &["--json", "check"]);
    assert_eq!(result.code(), Some(10), "log: {}", result.log_path.display());

    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["state"], "denied");
    assert_eq!(
        payload["verdict"]["reason"],
        "projected_usage_exceeds_threshold"
    );
    assert_eq!(payload["verdict"]["projected_usage_bytes"], 18_000);
    assert!(payload["alert"].is_null());

    assert!(!fx.lock_path.exists(), "check must not take the lock");
    assert!(fx.alerts().is_empty(), "check must not alert");
    assert!(!fx.home().join("producer-ran").exists());
    assert_eq!(
        fx.history_entries(),
        vec!["backup-a.tar".to_string(), "backup-b.tar".to_string()]
    );
}

#[test]
fn check_human_output_names_the_reason() {
    let fx = GuardFixture::new(WRITE_OK);
    fx.seed_artifact("backup-a.tar", 9_000);
    fx.seed_artifact("backup-b.tar", 9_000);

    let result = fx.run_human("check_human_denied", &["check"]);
    assert_eq!(result.code(), Some(10), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("DENIED"), "{}", result.stderr);
    assert!(result.stderr.contains("current usage already exceeds threshold"));
}

#[test]
fn check_output_format_env_selects_json() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run_with_env("check_env_json", &["check"], &[("BSG_OUTPUT_FORMAT", "json")]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["command"], "check");
}

// ──────────────────── history ────────────────────

#[test]
fn history_lists_newest_first_and_ignores_partials() {
    let fx = GuardFixture::new(WRITE_OK);
    let old = fx.seed_artifact("backup-20260101T000000Z.tar", 300);
    let new = fx.seed_artifact("backup-20260102T000000Z.tar", 500);
    fx.seed_artifact(".backup-20260103T000000Z.tar.partial", 900);
    fx.seed_artifact("notes.txt", 10);

    let base = SystemTime::now() - Duration::from_secs(3_600);
    filetime::set_file_mtime(&old, FileTime::from_system_time(base)).expect("set mtime");
    filetime::set_file_mtime(
        &new,
        FileTime::from_system_time(base + Duration::from_secs(60)),
    )
    .expect("set mtime");

    let result = fx.run("history_json", &["--json", "history"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["total"], 2);
    let artifacts = payload["artifacts"].as_array().expect("artifacts array");
    assert!(
        artifacts[0]["path"]
            .as_str()
            .is_some_and(|p| p.ends_with("backup-20260102T000000Z.tar"))
    );
    assert_eq!(artifacts[1]["size_bytes"], 300);
    assert_eq!(payload["estimate"]["bytes"], 500);
}

#[test]
fn history_limit_truncates_listing() {
    let fx = GuardFixture::new(WRITE_OK);
    for i in 0..4 {
        fx.seed_artifact(&format!("backup-{i}.tar"), 10 * (i + 1));
    }
    let result = fx.run("history_limit", &["--json", "history", "-n", "2"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    let payload: serde_json::Value =
        serde_json::from_str(result.stdout.trim()).expect("json payload");
    assert_eq!(payload["total"], 4);
    assert_eq!(payload["artifacts"].as_array().map(Vec::len), Some(2));
}

#[test]
fn history_on_missing_dir_is_empty() {
    let fx = GuardFixture::new(WRITE_OK);
    let result = fx.run_human("history_empty", &["history"]);
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("no completed backups"));
}
