//! Integration tests for the `weirding` binary
//!
//! Runs the built binary with isolated directories and an offline catalog.
//! Commands that touch block devices are only exercised up to their
//! privilege and terminal checks.

mod common;

use common::{TestHome, OFFLINE_CONFIG};
use predicates::prelude::*;

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_help_lists_every_command() {
    let home = TestHome::new();
    let output = home.run(&["--help"]);

    assert!(output.status.success());
    let text = stdout(&output);
    let commands = [
        "list-drives",
        "list-images",
        "setup-module",
        "relabel-drive",
        "cache",
        "version",
    ];
    for command in commands {
        assert!(predicate::str::contains(command).eval(&text), "missing {command} in:\n{text}");
    }
}

#[test]
fn test_version_json_reports_package_version() {
    let home = TestHome::new();
    let output = home.run(&["--json", "version"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let info: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("JSON output");
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    assert!(info["git_sha"].is_string());
}

#[test]
fn test_list_images_offline_uses_built_in_table() {
    let home = TestHome::new();
    home.write_config(OFFLINE_CONFIG);

    let output = home.run(&["--json", "list-images"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout(&output)).expect("JSON rows");
    assert!(!rows.is_empty());
    for row in &rows {
        let id = row["id"].as_str().unwrap();
        assert!(predicate::str::starts_with("ubuntu-").eval(id), "{id}");
        assert_eq!(row["cache"], "not cached");
    }
}

#[test]
fn test_list_images_text_names_the_source() {
    let home = TestHome::new();
    home.write_config(OFFLINE_CONFIG);

    let output = home.run(&["list-images"]);

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(predicate::str::contains("built-in table").eval(&stdout(&output)));
}

#[test]
fn test_cache_list_and_clean_on_empty_cache() {
    let home = TestHome::new();

    let listed = home.run(&["--json", "cache", "list"]);
    assert!(listed.status.success(), "{}", stderr(&listed));
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout(&listed)).unwrap();
    assert!(rows.is_empty());

    let cleaned = home.run(&["cache", "clean"]);
    assert!(cleaned.status.success(), "{}", stderr(&cleaned));
    assert!(predicate::str::contains("already empty").eval(&stdout(&cleaned)));
}

#[test]
fn test_cache_clean_removes_images() {
    let home = TestHome::new();
    std::fs::create_dir_all(home.images_dir()).unwrap();
    std::fs::write(home.images_dir().join("abc.img.part"), vec![0u8; 2048]).unwrap();

    let output = home.run(&["cache", "clean"]);

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(predicate::str::contains("Removed 1 file").eval(&stdout(&output)));
    assert!(!home.images_dir().join("abc.img.part").exists());
}

#[test]
fn test_failing_lsblk_is_reported_without_its_stderr() {
    let home = TestHome::new();
    home.write_config(OFFLINE_CONFIG);
    home.install_shim(
        "lsblk",
        "echo 'lsblk: failed to access sysfs directory: /sys/dev/block' >&2\nexit 32",
    );

    let output = home.run_with_shims(&["list-drives"]);

    assert_eq!(output.status.code(), Some(1));
    let text = stderr(&output);
    assert!(predicate::str::contains("Cannot list storage devices").eval(&text), "{text}");
    assert!(predicate::str::contains("exited with status 32").eval(&text), "{text}");
    assert!(!text.contains("sysfs"), "{text}");
}

#[test]
fn test_invalid_config_is_reported() {
    let home = TestHome::new();
    home.write_config("[catalog\nindex_url = ");

    let output = home.run(&["list-images"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(predicate::str::contains("Failed to parse config file").eval(&stderr(&output)));
}

#[test]
fn test_setup_module_refuses_to_run_unattended() {
    let home = TestHome::new();
    home.write_config(OFFLINE_CONFIG);

    // Output is captured, so stdin/stdout are never a terminal here
    let output = home.run(&["setup-module", "--version", "24.04"]);

    assert!(!output.status.success());
    if rustix::process::geteuid().is_root() {
        assert!(predicate::str::contains("terminal").eval(&stderr(&output)));
    } else {
        assert_eq!(output.status.code(), Some(6));
        assert!(predicate::str::contains("root").eval(&stderr(&output)));
    }
}

#[test]
fn test_relabel_drive_needs_root_or_a_real_disk() {
    let home = TestHome::new();

    let output = home.run(&["relabel-drive", "/dev/weirding-missing", "MODULE"]);

    assert!(!output.status.success());
    if !rustix::process::geteuid().is_root() {
        assert_eq!(output.status.code(), Some(6));
    }
}

#[test]
fn test_relabel_drive_rejects_missing_arguments() {
    let home = TestHome::new();
    let output = home.run(&["relabel-drive"]);

    assert_eq!(output.status.code(), Some(2));
}
