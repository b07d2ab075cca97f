//! Integration tests for the dealdesk CLI
//!
//! These tests exercise the binary the way an operator does: config
//! inspection, validation, and the watch entry point.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a dealdesk Command
fn dealdesk() -> Command {
    cargo_bin_cmd!("dealdesk")
}

/// Helper to create a temporary working directory
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_dealdesk_help() {
        dealdesk().arg("--help").assert().success();
    }

    #[test]
    fn test_dealdesk_version() {
        dealdesk().arg("--version").assert().success();
    }

    #[test]
    fn test_serve_help_lists_overrides() {
        dealdesk()
            .arg("serve")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--db-path"))
            .stdout(predicate::str::contains("--dev"));
    }

    #[test]
    fn test_watch_help_lists_actor_flags() {
        dealdesk()
            .arg("watch")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--server"))
            .stdout(predicate::str::contains("--role"))
            .stdout(predicate::str::contains("--actor-id"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        dealdesk().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = temp_dir();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("show")
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file at"))
            .stdout(predicate::str::contains("port = 3325"))
            .stdout(predicate::str::contains("kyc_pass_threshold = 70"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = temp_dir();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        let written = fs::read_to_string(dir.path().join("dealdesk.toml")).unwrap();
        assert!(written.contains("[server]"));
        assert!(written.contains("port = 3325"));
        assert!(written.contains("[poller]"));
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = temp_dir();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("init")
            .assert()
            .success();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = temp_dir();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_with_config() {
        let dir = temp_dir();
        let config_content = r#"
[server]
port = 4000

[engine]
kyc_pass_threshold = 80
"#;
        fs::write(dir.path().join("dealdesk.toml"), config_content).unwrap();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = temp_dir();
        let config_content = r#"
[engine]
kyc_pass_threshold = 150

[poller]
critical_interval_secs = 30
secondary_interval_secs = 5
"#;
        fs::write(dir.path().join("dealdesk.toml"), config_content).unwrap();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("kyc_pass_threshold"))
            .stdout(predicate::str::contains("critical interval"));
    }

    #[test]
    fn test_config_show_reads_custom_path() {
        let dir = temp_dir();
        let config_path = dir.path().join("custom.toml");
        let config_content = r#"
[server]
port = 9100
db_path = "/tmp/deals.db"
"#;
        fs::write(&config_path, config_content).unwrap();

        dealdesk()
            .arg("--config")
            .arg(&config_path)
            .arg("config")
            .arg("show")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"))
            .stdout(predicate::str::contains("/tmp/deals.db"));
    }

    #[test]
    fn test_env_override_wins_over_file() {
        let dir = temp_dir();
        let config_content = r#"
[server]
port = 9100
"#;
        fs::write(dir.path().join("dealdesk.toml"), config_content).unwrap();

        dealdesk()
            .current_dir(dir.path())
            .env("DEALDESK_PORT", "9200")
            .arg("config")
            .arg("show")
            .assert()
            .success()
            .stdout(predicate::str::contains("Effective values"))
            .stdout(predicate::str::contains("port = 9200"));
    }

    #[test]
    fn test_config_show_malformed_toml_fails() {
        let dir = temp_dir();
        fs::write(dir.path().join("dealdesk.toml"), "[server\nport = oops").unwrap();

        dealdesk()
            .current_dir(dir.path())
            .arg("config")
            .arg("show")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse dealdesk.toml"));
    }
}

// =============================================================================
// Watch Entry Point Tests
// =============================================================================

mod watch {
    use super::*;

    #[test]
    fn test_watch_rejects_unknown_role() {
        let dir = temp_dir();

        dealdesk()
            .current_dir(dir.path())
            .arg("watch")
            .arg("7")
            .arg("--role")
            .arg("landlord")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid actor role"));
    }

    #[test]
    fn test_watch_requires_transaction_id() {
        dealdesk().arg("watch").assert().failure();
    }
}
