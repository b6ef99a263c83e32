//! Tests for the drover binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn drover(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("drover").unwrap();
    cmd.current_dir(dir);
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("drover.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[drover]
local_workers = 2
max_workers = 2
lock_dir = "{locks}"
root = "{root}"

[report]
output_dir = "{out}"
"#,
            locks = dir.join("locks").display(),
            root = dir.join("ws").display(),
            out = dir.join("results").display(),
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_help() {
    let dir = tempfile::tempdir().unwrap();
    drover(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Distributed test sharding"));
}

#[test]
fn test_validate_good_and_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    drover(dir.path())
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[drover]\nrun_command = \"make test\"\n").unwrap();
    drover(dir.path())
        .arg("-c")
        .arg(&bad)
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_run_passing_build_writes_junit() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    drover(dir.path())
        .arg("-c")
        .arg(&config)
        .args(["run", "--run-command", "echo {test_id}", "tests.a", "tests.b", "tests.c"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Ran 3 tests"))
        .stdout(predicate::str::contains("OK"));

    let junit = std::fs::read_to_string(dir.path().join("results/junit.xml")).unwrap();
    assert!(junit.contains("<testsuite"));
    assert!(junit.contains(r#"tests="3""#));
}

#[test]
fn test_run_failing_build_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    drover(dir.path())
        .arg("-c")
        .arg(&config)
        .args([
            "run",
            "--run-command",
            "case {test_id} in *bad) exit 1;; esac",
            "tests.ok",
            "tests.bad",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED (errors=1)"));
}

#[test]
fn test_run_filter_excluding_everything_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    drover(dir.path())
        .arg("-c")
        .arg(&config)
        .args(["run", "--run-command", "echo {test_id}", "--exclude", ".", "tests.a"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Ran 0 tests"));
}

#[test]
fn test_run_without_units_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    drover(dir.path())
        .arg("-c")
        .arg(&config)
        .args(["run", "--run-command", "echo {test_id}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No test units given"));
}

#[test]
fn test_aggregate_result_files() {
    let dir = tempfile::tempdir().unwrap();
    let line = |test_id: &str, exit_code: i32| {
        format!(
            r#"{{"job_id":0,"build_id":"b1","test_id":"{}","worker":"w1","exit_code":{},"stdout":"","stderr":"","started_at":"2024-01-01T00:00:00Z","finished_at":"2024-01-01T00:00:01Z"}}"#,
            test_id, exit_code
        )
    };
    let passing = dir.path().join("a.jsonl");
    std::fs::write(&passing, format!("{}\n{}\n", line("t1", 0), line("t2", 0))).unwrap();
    let failing = dir.path().join("b.jsonl");
    std::fs::write(&failing, format!("{}\n", line("t3", 2))).unwrap();

    drover(dir.path())
        .arg("aggregate")
        .arg(&passing)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Ran 2 tests"));

    drover(dir.path())
        .arg("aggregate")
        .arg(&passing)
        .arg(&failing)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("exited with code 2"));
}

#[test]
fn test_aggregate_empty_results_is_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.jsonl");
    std::fs::write(&empty, "").unwrap();

    drover(dir.path())
        .arg("aggregate")
        .arg(&empty)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("NOT RUN (no job results)"))
        .stdout(predicate::str::contains("All tests passed!").not());
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    drover(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created drover.toml"));

    let written = std::fs::read_to_string(dir.path().join("drover.toml")).unwrap();
    assert!(written.contains("python -m unittest {test_id}"));
    drover(dir.path())
        .arg("validate")
        .assert()
        .success();

    drover(dir.path()).arg("init").assert().code(1);
}
