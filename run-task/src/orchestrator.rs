//! Task orchestrator: sequences privilege resolution, cache checks,
//! checkouts and the task itself, and turns the result into one outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use tracing::{error, info, instrument, warn};

use crate::cli::env_prefix;
use crate::core::privilege::decide;
use crate::core::state::{RunState, StateTracker};
use crate::core::types::{
    CacheEntry, ExitOutcome, RepositoryDescriptor, TaskIdentity, TaskInvocation,
    VolumeDeclaration,
};
use crate::error::RunTaskError;
use crate::io::cache::{CacheState, check_caches, check_volumes};
use crate::io::checkout::{CheckoutContext, CheckoutResult, VcsClients, checkout_all};
use crate::io::config::RunTaskConfig;
use crate::io::privilege::{RunAs, UserDatabase, apply, resolve};
use crate::io::probe::EnvironmentReport;
use crate::io::secrets::SecretStore;
use crate::io::supervisor::{SupervisorOptions, supervise};
use crate::status::StatusLog;

/// What to run, fully parsed from the command line and environment.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub user: String,
    pub group: String,
    pub descriptors: Vec<RepositoryDescriptor>,
    pub caches: Vec<PathBuf>,
    pub volumes: Vec<PathBuf>,
    pub command: Vec<String>,
    pub task_cwd: Option<PathBuf>,
    pub hg_store_path: Option<PathBuf>,
    pub fetches: Option<String>,
    pub fetch_hg_fingerprint: bool,
}

/// Collaborators of a run.
pub struct RunContext<'a> {
    pub report: &'a EnvironmentReport,
    pub config: &'a RunTaskConfig,
    pub users: &'a dyn UserDatabase,
    pub secrets: &'a dyn SecretStore,
    pub clients: &'a VcsClients,
    pub status: &'a StatusLog,
    pub supervisor: SupervisorOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: ExitOutcome,
    pub state_history: Vec<RunState>,
    pub checkouts: Vec<CheckoutResult>,
}

/// Run `request` to completion. Never exits the process; the caller turns
/// [`RunReport::outcome`] into an exit code.
#[instrument(skip_all, fields(user = %request.user, group = %request.group))]
pub fn run_task(request: &TaskRequest, ctx: &RunContext<'_>) -> RunReport {
    let mut tracker = StateTracker::default();
    let mut checkouts = Vec::new();
    let outcome = match drive(request, ctx, &mut tracker, &mut checkouts) {
        Ok(code) => ExitOutcome::from_child_code(code),
        Err(err) => {
            error!(state = %tracker.current(), err = %err, "run aborted");
            ctx.status.emit("setup", &err.diagnostic());
            if !tracker.current().is_terminal() {
                let _ = tracker.advance(RunState::Aborted);
            }
            err.outcome()
        }
    };
    info!(code = outcome.code(), "run finished");
    RunReport {
        outcome,
        state_history: tracker.history().to_vec(),
        checkouts,
    }
}

fn advance(tracker: &mut StateTracker, next: RunState) -> Result<(), RunTaskError> {
    tracker.advance(next).map_err(RunTaskError::State)
}

fn drive(
    request: &TaskRequest,
    ctx: &RunContext<'_>,
    tracker: &mut StateTracker,
    checkouts: &mut Vec<CheckoutResult>,
) -> Result<i32, RunTaskError> {
    if request.command.is_empty() {
        return Err(RunTaskError::MissingCommand);
    }
    let report = ctx.report;

    let decision = decide(
        report.platform,
        report.current_uid.as_deref(),
        &request.user,
        &request.group,
    );
    let identity = resolve(&decision, report, ctx.users)?;
    let run_as = apply(&identity);
    if let (true, Some((uid, gid))) = (run_as.switches_identity(), identity.ids()) {
        ctx.status.emit(
            "setup",
            &format!(
                "running as {}:{} (uid={uid} gid={gid})",
                identity.run_as_user, identity.run_as_group
            ),
        );
    }
    advance(tracker, RunState::PrivilegeResolved)?;

    verify_storage(request, &identity, &run_as, ctx.status)?;
    advance(tracker, RunState::CacheVerified)?;

    let checkout_ctx = CheckoutContext {
        config: ctx.config,
        working_directory: &report.working_directory,
        run_as: &run_as,
        clients: ctx.clients,
        secrets: ctx.secrets,
        status: ctx.status,
        hg_store_path: request.hg_store_path.as_deref(),
        fetches: request.fetches.as_deref(),
        fetch_hg_fingerprint: request.fetch_hg_fingerprint,
        supervisor: ctx.supervisor,
    };
    *checkouts = checkout_all(&request.descriptors, &checkout_ctx)?;
    advance(tracker, RunState::ChecksComplete)?;
    ctx.status.emit(
        "setup",
        &format!(
            "checks complete: {} cache(s), {} volume(s), {} checkout(s)",
            request.caches.len(),
            request.volumes.len(),
            checkouts.len()
        ),
    );

    let invocation = TaskInvocation {
        command: request.command.clone(),
        working_directory: task_directory(request, report),
        environment: task_environment(report, checkouts),
        run_as: identity,
    };
    advance(tracker, RunState::Running)?;
    let code = launch(invocation, ctx)?;
    advance(tracker, RunState::Exited)?;
    ctx.status
        .emit("taskcluster", &format!("task exited with code {code}"));
    Ok(code)
}

/// Cache markers and volume emptiness, with one status line per path.
///
/// Without a known uid/gid there is nothing trustworthy to record, so cache
/// markers are neither written nor compared.
fn verify_storage(
    request: &TaskRequest,
    identity: &TaskIdentity,
    run_as: &RunAs,
    status: &StatusLog,
) -> Result<(), RunTaskError> {
    match identity.ids() {
        Some((uid, gid)) => {
            let caches: Vec<CacheEntry> = request
                .caches
                .iter()
                .map(|path| CacheEntry {
                    path: path.clone(),
                    expected_uid: uid,
                    expected_gid: gid,
                })
                .collect();
            let states = check_caches(&caches, run_as)?;
            for (cache, state) in caches.iter().zip(states) {
                let verb = match state {
                    CacheState::Established => "established",
                    CacheState::Verified => "verified",
                };
                status.emit(
                    "cache",
                    &format!("cache {} {verb} for uid={uid} gid={gid}", cache.path.display()),
                );
            }
        }
        None => {
            for path in &request.caches {
                warn!(path = %path.display(), "task uid/gid unknown; cache ownership not checked");
                status.emit(
                    "cache",
                    &format!(
                        "cache {} not verified: task uid/gid unknown",
                        path.display()
                    ),
                );
            }
        }
    }

    let volumes: Vec<VolumeDeclaration> = request
        .volumes
        .iter()
        .map(|path| VolumeDeclaration { path: path.clone() })
        .collect();
    for path in check_volumes(&volumes, &request.caches, run_as)? {
        status.emit("volume", &format!("volume {} is empty", path.display()));
    }
    Ok(())
}

fn task_directory(request: &TaskRequest, report: &EnvironmentReport) -> PathBuf {
    match &request.task_cwd {
        Some(cwd) if cwd.is_absolute() => cwd.clone(),
        Some(cwd) => report.working_directory.join(cwd),
        None => report.working_directory.clone(),
    }
}

/// Variables the task sees on top of the inherited environment.
pub fn task_environment(
    report: &EnvironmentReport,
    checkouts: &[CheckoutResult],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "TASK_WORKDIR".to_string(),
        report.working_directory.display().to_string(),
    );
    for checkout in checkouts {
        env.insert(
            format!("{}_PATH", env_prefix(&checkout.key)),
            checkout.checkout_path.display().to_string(),
        );
    }
    env
}

fn launch(invocation: TaskInvocation, ctx: &RunContext<'_>) -> Result<i32, RunTaskError> {
    let TaskInvocation {
        command,
        working_directory,
        environment,
        run_as,
    } = invocation;
    let Some((program, args)) = command.split_first() else {
        return Err(RunTaskError::MissingCommand);
    };

    ctx.status.emit(
        "setup",
        &format!("running {} in {}", command.join(" "), working_directory.display()),
    );
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&working_directory)
        .envs(&environment);
    apply(&run_as).configure(&mut cmd);

    supervise(cmd, ctx.status, "task", ctx.supervisor).map_err(|source| RunTaskError::Launch {
        program: program.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Platform;
    use crate::io::vcs::CheckoutAction;
    use crate::test_support::{FakeSecrets, FakeUserDatabase, ScriptedVcsClient, SharedBuffer, report};

    struct Fixture {
        report: EnvironmentReport,
        config: RunTaskConfig,
        users: FakeUserDatabase,
        secrets: FakeSecrets,
        clients: VcsClients,
        buffer: SharedBuffer,
        status: StatusLog,
        _work: tempfile::TempDir,
    }

    impl Fixture {
        fn new(uid: &str) -> Self {
            Self::with_uid(Some(uid))
        }

        fn with_uid(uid: Option<&str>) -> Self {
            let work = tempfile::tempdir().expect("tempdir");
            let mut report = report(Platform::Posix, uid);
            report.working_directory = work.path().to_path_buf();
            let buffer = SharedBuffer::default();
            Self {
                report,
                config: RunTaskConfig::default(),
                users: FakeUserDatabase::default(),
                secrets: FakeSecrets::default(),
                clients: VcsClients {
                    git: Box::new(ScriptedVcsClient::git()),
                    hg: Box::new(ScriptedVcsClient::hg()),
                },
                status: StatusLog::new(buffer.clone()),
                buffer,
                _work: work,
            }
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext {
                report: &self.report,
                config: &self.config,
                users: &self.users,
                secrets: &self.secrets,
                clients: &self.clients,
                status: &self.status,
                supervisor: SupervisorOptions {
                    forward_signals: false,
                },
            }
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn empty_command_aborts_from_init() {
        let fixture = Fixture::new("1000");
        let report = run_task(&TaskRequest::default(), &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::ConfigurationDefect);
        assert_eq!(report.state_history, [RunState::Init, RunState::Aborted]);
    }

    #[cfg(unix)]
    #[test]
    fn successful_run_walks_every_state() {
        let fixture = Fixture::new("1000");
        let request = TaskRequest {
            command: sh("exit 0"),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::Success);
        assert_eq!(
            report.state_history,
            [
                RunState::Init,
                RunState::PrivilegeResolved,
                RunState::CacheVerified,
                RunState::ChecksComplete,
                RunState::Running,
                RunState::Exited,
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn task_sees_workdir_and_checkout_paths() {
        let fixture = Fixture::new("1000");
        let mut descriptor = crate::test_support::descriptor("ci-config", "ci");
        descriptor.display_name = "CI config".to_string();
        let request = TaskRequest {
            descriptors: vec![descriptor],
            command: sh("echo \"$TASK_WORKDIR|$CI_CONFIG_PATH\""),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::Success);
        assert_eq!(report.checkouts[0].action, CheckoutAction::FreshClone);

        let workdir = fixture.report.working_directory.display().to_string();
        let expected = format!("] {workdir}|{workdir}/ci");
        assert!(fixture.buffer.contents().contains(&expected));
    }

    #[cfg(unix)]
    #[test]
    fn task_cwd_is_relative_to_working_directory() {
        let fixture = Fixture::new("1000");
        std::fs::create_dir(fixture.report.working_directory.join("sub")).expect("mkdir");
        let request = TaskRequest {
            command: sh("pwd"),
            task_cwd: Some(PathBuf::from("sub")),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::Success);
        assert!(fixture.buffer.contents().contains("/sub\n"));
    }

    #[cfg(unix)]
    #[test]
    fn task_failure_code_is_propagated() {
        let fixture = Fixture::new("1000");
        let request = TaskRequest {
            command: sh("exit 9"),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::TaskFailure(9));
        assert_eq!(report.outcome.code(), 9);
        assert_eq!(report.state_history.last(), Some(&RunState::Exited));
    }

    #[test]
    fn unknown_run_as_user_aborts_before_caches() {
        let fixture = Fixture::new("0");
        let cache = fixture.report.working_directory.join("cache");
        let request = TaskRequest {
            user: "ghost".to_string(),
            group: "ghost".to_string(),
            caches: vec![cache.clone()],
            command: sh("true"),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &fixture.ctx());
        assert_eq!(report.outcome, ExitOutcome::ConfigurationDefect);
        assert!(!report.state_history.contains(&RunState::PrivilegeResolved));
        assert!(!cache.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unknown_uid_never_claims_a_cache() {
        let unknown = Fixture::with_uid(None);
        let cache = unknown.report.working_directory.join("cache");
        std::fs::create_dir(&cache).expect("mkdir");
        let request = TaskRequest {
            caches: vec![cache.clone()],
            command: sh("true"),
            ..TaskRequest::default()
        };
        let report = run_task(&request, &unknown.ctx());
        assert_eq!(report.outcome, ExitOutcome::Success);
        assert!(!cache.join(crate::core::marker::MARKER_FILE).exists());
        assert!(unknown.buffer.contents().contains("not verified: task uid/gid unknown"));

        let mut known = Fixture::new("1000");
        known.report.working_directory = unknown.report.working_directory.clone();
        let report = run_task(&request, &known.ctx());
        assert_eq!(report.outcome, ExitOutcome::Success);
        let marker = std::fs::read_to_string(cache.join(crate::core::marker::MARKER_FILE))
            .expect("marker");
        assert_eq!(marker, "gid=1000\nuid=1000\nversion=1\n");
    }

    #[test]
    fn environment_lists_every_checkout() {
        let report = report(Platform::Posix, Some("1000"));
        let checkouts = vec![CheckoutResult {
            key: "vcs".to_string(),
            checkout_path: PathBuf::from("/builds/worker/checkouts/gecko"),
            action: CheckoutAction::FreshClone,
            revision: "abc".to_string(),
        }];
        let env = task_environment(&report, &checkouts);
        assert_eq!(
            env.get("VCS_PATH").map(String::as_str),
            Some("/builds/worker/checkouts/gecko")
        );
        assert_eq!(
            env.get("TASK_WORKDIR").map(String::as_str),
            Some("/builds/worker")
        );
    }
}
