//! CLI tests for the `run-task` binary.
//!
//! Spawns the binary with the current user as the run-as identity so the
//! tests behave the same whether or not they run as root.

#![cfg(unix)]

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Output, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Group, Pid, User, getgid, getuid};
use run_task::exit_codes;

fn current_user_and_group() -> (String, String) {
    let user = User::from_uid(getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| getuid().to_string());
    let group = Group::from_gid(getgid())
        .ok()
        .flatten()
        .map(|group| group.name)
        .unwrap_or_else(|| getgid().to_string());
    (user, group)
}

fn run_task(cwd: &std::path::Path) -> Command {
    let (user, group) = current_user_and_group();
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_run-task"));
    cmd.current_dir(cwd)
        .args(["--user", &user, "--group", &group])
        .env_remove("REPOSITORIES")
        .env_remove("TASKCLUSTER_CACHES")
        .env_remove("TASKCLUSTER_VOLUMES")
        .env_remove("MOZ_FETCHES")
        .env_remove("HG_STORE_PATH")
        .env_remove("RUN_TASK_CONFIG");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn child_exit_code_is_propagated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run_task(temp.path())
        .args(["--", "sh", "-c", "echo hello; exit 5"])
        .output()
        .expect("run-task");

    assert_eq!(output.status.code(), Some(5));
    assert!(stdout(&output).contains("] hello"));
}

#[test]
fn successful_child_exits_zero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = run_task(temp.path())
        .args(["--", "true"])
        .status()
        .expect("run-task");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn non_empty_volume_exits_with_configuration_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let volume = temp.path().join("outputs");
    fs::create_dir(&volume).expect("mkdir");
    fs::write(volume.join("stale.txt"), "x").expect("write");

    let output = run_task(temp.path())
        .env("TASKCLUSTER_VOLUMES", &volume)
        .args(["--", "true"])
        .output()
        .expect("run-task");

    assert_eq!(output.status.code(), Some(exit_codes::CONFIGURATION));
    assert!(stdout(&output).contains(&format!("volume {} is not empty", volume.display())));
}

#[test]
fn cache_marker_mismatch_exits_with_purge_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    fs::create_dir(&cache).expect("mkdir");
    let foreign = getuid().as_raw().wrapping_add(1);
    fs::write(
        cache.join(".cacherequires"),
        format!("gid={foreign}\nuid={foreign}\nversion=1\n"),
    )
    .expect("marker");

    let output = run_task(temp.path())
        .env("TASKCLUSTER_CACHES", &cache)
        .args(["--", "true"])
        .output()
        .expect("run-task");

    assert_eq!(output.status.code(), Some(exit_codes::PURGE_CACHE));
    assert!(stdout(&output).contains("UID/GID mismatch"));
}

#[test]
fn malformed_repositories_exit_with_configuration_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = run_task(temp.path())
        .env("REPOSITORIES", "not json")
        .args(["--", "true"])
        .status()
        .expect("run-task");
    assert_eq!(status.code(), Some(exit_codes::CONFIGURATION));
}

#[test]
fn missing_command_exits_with_configuration_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run_task(temp.path()).output().expect("run-task");
    assert_eq!(output.status.code(), Some(exit_codes::CONFIGURATION));
    assert!(stdout(&output).contains("no task command given"));
}

#[test]
fn missing_config_file_exits_with_configuration_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run_task(temp.path())
        .env("RUN_TASK_CONFIG", temp.path().join("run-task.tomll"))
        .args(["--", "true"])
        .output()
        .expect("run-task");
    assert_eq!(output.status.code(), Some(exit_codes::CONFIGURATION));
    assert!(stdout(&output).contains("run-task.tomll"));
}

#[test]
fn checkout_without_head_repository_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run_task(temp.path())
        .env_remove("VCS_HEAD_REPOSITORY")
        .args(["--vcs-checkout", "src", "--", "true"])
        .output()
        .expect("run-task");
    assert_eq!(output.status.code(), Some(exit_codes::CONFIGURATION));
    assert!(stdout(&output).contains("VCS_HEAD_REPOSITORY"));
}

#[test]
fn sigterm_is_forwarded_to_the_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = "trap 'echo got-term; kill $pid; exit 3' TERM; \
                  sleep 30 >/dev/null 2>&1 & pid=$!; echo ready; wait";
    let mut child = run_task(temp.path())
        .args(["--", "sh", "-c", script])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("run-task");

    let mut reader = BufReader::new(child.stdout.take().expect("stdout"));
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).expect("read");
        assert!(read > 0, "task output ended before it was ready");
        if line.trim_end().ends_with("] ready") {
            break;
        }
    }

    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid"));
    kill(pid, Signal::SIGTERM).expect("signal run-task");

    let mut rest = String::new();
    reader.read_to_string(&mut rest).expect("read");
    let status = child.wait().expect("wait");
    assert_eq!(status.code(), Some(3), "output after signal: {rest}");
    assert!(rest.contains("] got-term"));
}

#[test]
fn help_exits_zero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = Command::new(env!("CARGO_BIN_EXE_run-task"))
        .current_dir(temp.path())
        .env("REPOSITORIES", r#"{"ci-config": "CI configuration"}"#)
        .arg("--help")
        .output()
        .expect("run-task");
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("--ci-config-checkout"));
}
