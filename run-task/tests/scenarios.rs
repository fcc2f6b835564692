//! End-to-end runs of the orchestrator against fake collaborators.
//!
//! The task command is a real `sh` child; VCS clients, the user database and
//! the secrets service are fakes so the runs need neither root nor network.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use run_task::core::marker::{CacheMarker, MARKER_FILE};
use run_task::core::state::RunState;
use run_task::core::types::{ExitOutcome, Platform};
use run_task::exit_codes;
use run_task::io::checkout::VcsClients;
use run_task::io::config::RunTaskConfig;
use run_task::io::probe::EnvironmentReport;
use run_task::io::supervisor::SupervisorOptions;
use run_task::io::vcs::{CheckoutAction, VcsFailure};
use run_task::orchestrator::{RunContext, RunReport, TaskRequest, run_task};
use run_task::status::StatusLog;
use run_task::test_support::{
    FakeSecrets, FakeUserDatabase, ScriptedVcsClient, SharedBuffer, descriptor, report,
};

struct World {
    work: tempfile::TempDir,
    report: EnvironmentReport,
    config: RunTaskConfig,
    users: FakeUserDatabase,
    secrets: FakeSecrets,
    git: ScriptedVcsClient,
    clients: VcsClients,
    log: SharedBuffer,
    status: StatusLog,
}

impl World {
    /// A worker where run-task itself runs as `uid` (no de-escalation).
    fn as_uid(uid: &str) -> Self {
        let work = tempfile::tempdir().expect("tempdir");
        let mut report = report(Platform::Posix, Some(uid));
        report.working_directory = work.path().to_path_buf();
        let git = ScriptedVcsClient::git();
        let log = SharedBuffer::default();
        Self {
            report,
            config: RunTaskConfig::default(),
            users: FakeUserDatabase::default(),
            secrets: FakeSecrets::default(),
            clients: VcsClients {
                git: Box::new(git.clone()),
                hg: Box::new(ScriptedVcsClient::hg()),
            },
            git,
            status: StatusLog::new(log.clone()),
            log,
            work,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.work.path().join(relative)
    }

    fn run(&self, request: &TaskRequest) -> RunReport {
        let ctx = RunContext {
            report: &self.report,
            config: &self.config,
            users: &self.users,
            secrets: &self.secrets,
            clients: &self.clients,
            status: &self.status,
            supervisor: SupervisorOptions {
                forward_signals: false,
            },
        };
        run_task(request, &ctx)
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn write_marker(cache: &Path, uid: u32, gid: u32) {
    fs::create_dir_all(cache).expect("mkdir cache");
    fs::write(cache.join(MARKER_FILE), CacheMarker { uid, gid }.render()).expect("marker");
}

#[test]
fn fresh_worker_runs_the_task() {
    let world = World::as_uid("1000");
    let volume = world.path("build/outputs");
    fs::create_dir_all(&volume).expect("mkdir volume");
    let cache = world.path("caches/level-3-checkouts");

    let request = TaskRequest {
        descriptors: vec![descriptor("vcs", "checkouts/gecko")],
        caches: vec![cache.clone()],
        volumes: vec![volume.clone()],
        command: sh("test -d \"$VCS_PATH/.git\""),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome, ExitOutcome::Success);
    assert!(report.state_history.contains(&RunState::Running));
    assert_eq!(report.checkouts.len(), 1);
    assert_eq!(report.checkouts[0].action, CheckoutAction::FreshClone);
    assert_eq!(world.git.calls()[0].revision, None);

    let marker = fs::read_to_string(cache.join(MARKER_FILE)).expect("marker written");
    assert_eq!(
        CacheMarker::parse(&marker).expect("parse"),
        CacheMarker {
            uid: 1000,
            gid: 1000
        }
    );

    let log = world.log.contents();
    let phase_lines: Vec<&str> = log
        .lines()
        .filter(|line| !line.starts_with("[task "))
        .collect();
    let position = |needle: &str| {
        phase_lines
            .iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no status line containing {needle:?} in:\n{log}"))
    };
    let cache_line = position(&format!(
        "cache {} established for uid=1000 gid=1000",
        cache.display()
    ));
    let volume_line = position(&format!("volume {} is empty", volume.display()));
    let checkout_line = position("checked out at");
    let complete_line = position("checks complete: 1 cache(s), 1 volume(s), 1 checkout(s)");
    assert!(phase_lines[cache_line].starts_with("[cache "));
    assert!(phase_lines[volume_line].starts_with("[volume "));
    assert!(cache_line < volume_line && volume_line < checkout_line);
    assert!(checkout_line < complete_line);

    let again = world.run(&request);
    assert_eq!(again.outcome, ExitOutcome::Success);
    assert!(world.log.contents().contains(&format!(
        "cache {} verified for uid=1000 gid=1000",
        cache.display()
    )));
}

#[test]
fn cache_from_another_uid_requires_purge() {
    let world = World::as_uid("1001");
    let cache = world.path("caches/level-3-checkouts");
    write_marker(&cache, 1000, 1000);

    let request = TaskRequest {
        descriptors: vec![descriptor("vcs", "checkouts/gecko")],
        caches: vec![cache],
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome.code(), exit_codes::PURGE_CACHE);
    assert_eq!(report.state_history.last(), Some(&RunState::Aborted));
    assert!(!report.state_history.contains(&RunState::CacheVerified));
    assert!(world.git.calls().is_empty());
    assert!(world.log.contents().contains("There is a UID/GID mismatch on the cache"));
}

#[test]
fn populated_volume_is_a_configuration_defect() {
    let world = World::as_uid("1000");
    let volume = world.path("build/outputs");
    fs::create_dir_all(&volume).expect("mkdir volume");
    fs::write(volume.join("leftover.o"), "").expect("populate volume");

    let request = TaskRequest {
        volumes: vec![volume.clone()],
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome.code(), exit_codes::CONFIGURATION);
    let log = world.log.contents();
    assert!(log.contains(&format!("error: volume {} is not empty", volume.display())));
    assert!(log.contains("Our Docker image policy requires volumes to be empty."));
}

#[test]
fn volume_holding_only_a_directory_is_not_empty() {
    let world = World::as_uid("1000");
    let volume = world.path("build/outputs");
    fs::create_dir_all(volume.join("nested")).expect("mkdir");

    let request = TaskRequest {
        volumes: vec![volume],
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    assert_eq!(world.run(&request).outcome, ExitOutcome::ConfigurationDefect);
}

#[test]
fn missing_fetch_content_is_a_configuration_defect() {
    let world = World::as_uid("1000");
    let request = TaskRequest {
        descriptors: vec![descriptor("vcs", "checkouts/gecko")],
        fetches: Some(r#"[{"artifact": "public/build/target.tar.zst", "task": "abc"}]"#.to_string()),
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome.code(), exit_codes::CONFIGURATION);
    assert!(!report.state_history.contains(&RunState::ChecksComplete));
    let log = world.log.contents();
    assert!(log.contains("error: fetch-content script not found"));
    assert!(!log.contains("error: error:"));
    assert!(log.contains("taskcluster/scripts/misc/fetch-content"));
}

#[test]
fn checkout_network_failure_is_transient() {
    let world = World::as_uid("1000");
    world.git.fail_next(VcsFailure::Exited {
        command: "git clone".to_string(),
        code: Some(128),
        stderr: "fatal: unable to access 'https://example.com/vcs/': Could not resolve host"
            .to_string(),
    });
    let request = TaskRequest {
        descriptors: vec![descriptor("vcs", "src"), descriptor("tools", "tools")],
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome.code(), exit_codes::TRANSIENT);
    assert_eq!(world.git.calls().len(), 1);
}

#[test]
fn second_run_updates_pinned_checkout() {
    let world = World::as_uid("1000");
    let mut pinned = descriptor("vcs", "src");
    pinned.revision = run_task::core::types::Revision::Named("f00dfeed".to_string());
    let request = TaskRequest {
        descriptors: vec![pinned],
        command: sh("exit 0"),
        ..TaskRequest::default()
    };

    let first = world.run(&request);
    let second = world.run(&request);
    assert_eq!(first.checkouts[0].action, CheckoutAction::FreshClone);
    assert_eq!(second.checkouts[0].action, CheckoutAction::Update);
    assert_eq!(second.checkouts[0].revision, "f00dfeed");
}

#[test]
fn task_exit_code_and_output_pass_through() {
    let world = World::as_uid("1000");
    let request = TaskRequest {
        command: sh("echo building; exit 3"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);

    assert_eq!(report.outcome, ExitOutcome::TaskFailure(3));
    assert_eq!(report.state_history.last(), Some(&RunState::Exited));
    let log = world.log.contents();
    assert!(log.lines().any(|line| line.starts_with("[task ") && line.ends_with("] building")));
}

#[test]
fn root_without_capability_cannot_deescalate() {
    let mut world = World::as_uid("0");
    world.users = FakeUserDatabase::default()
        .with_user("worker", 1000, 1000)
        .with_effective_uid(Some(1000));
    let request = TaskRequest {
        user: "worker".to_string(),
        group: "worker".to_string(),
        command: sh("exit 0"),
        ..TaskRequest::default()
    };
    let report = world.run(&request);
    assert_eq!(report.outcome.code(), exit_codes::PRIVILEGE);
}
