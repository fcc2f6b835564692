//! VCS client adapters.
//!
//! Clone and update mechanics belong to the external `git` and `hg` binaries;
//! this module only builds their command lines, runs them as the task
//! identity and reports failures with enough detail to classify them.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::io::privilege::RunAs;
use crate::io::process::{
    CommandOutput, is_permission_denied, is_program_missing, run_command_with_timeout,
};

/// How the coordinator wants a checkout brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutAction {
    /// Clone into an empty (or absent) destination.
    FreshClone,
    /// Move an existing checkout to the requested revision.
    Update,
}

/// One request to a [`VcsClient`].
#[derive(Debug, Clone)]
pub struct VcsRequest<'a> {
    pub action: CheckoutAction,
    pub source_url: &'a str,
    pub base_url: Option<&'a str>,
    /// `None` checks out the remote's default head.
    pub revision: Option<&'a str>,
    pub dest: &'a Path,
    /// Repository-relative sparse profile.
    pub sparse_profile: Option<&'a Path>,
    /// Shared store directory (hg only).
    pub store_path: Option<&'a Path>,
    /// Extra `--config` values (hg only).
    pub hg_config: &'a [String],
    /// Extra environment, e.g. `GIT_SSH_COMMAND`.
    pub env: &'a [(String, String)],
    pub run_as: &'a RunAs,
}

/// Why a VCS command failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VcsFailure {
    /// The client binary is not installed.
    #[error("{program} is not installed")]
    ClientMissing { program: String },

    /// The client could not be started as the task identity.
    #[error("{program} could not be started as the task user")]
    PermissionDenied { program: String },

    #[error("{command} timed out")]
    TimedOut { command: String },

    #[error("{command} failed with status {code:?}: {}", .stderr.trim())]
    Exited {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{message}")]
    Other { message: String },
}

/// Abstraction over VCS backends.
pub trait VcsClient {
    /// Bring `request.dest` to the requested revision and return the
    /// revision that ended up checked out.
    fn sync(&self, request: &VcsRequest<'_>) -> Result<String, VcsFailure>;
}

/// Shared subprocess plumbing for the concrete clients.
#[derive(Debug, Clone)]
struct Invoker {
    program: &'static str,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Invoker {
    fn run<I, S>(
        &self,
        request: &VcsRequest<'_>,
        args: I,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, VcsFailure>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let label = format!(
            "{} {}",
            self.program,
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut cmd = Command::new(self.program);
        cmd.args(&args);
        request.run_as.configure(&mut cmd);
        for (key, value) in request.env {
            cmd.env(key, value);
        }
        if self.program == "git" {
            cmd.env("GIT_TERMINAL_PROMPT", "0");
        }

        debug!(command = %label, "running vcs command");
        let output = run_command_with_timeout(cmd, stdin, self.timeout, self.output_limit_bytes)
            .map_err(|err| {
                if is_program_missing(&err) {
                    VcsFailure::ClientMissing {
                        program: self.program.to_string(),
                    }
                } else if is_permission_denied(&err) {
                    VcsFailure::PermissionDenied {
                        program: self.program.to_string(),
                    }
                } else {
                    VcsFailure::Other {
                        message: format!("{label}: {err:#}"),
                    }
                }
            })?;

        if output.timed_out {
            return Err(VcsFailure::TimedOut { command: label });
        }
        if !output.success() {
            return Err(VcsFailure::Exited {
                command: label,
                code: output.status.code(),
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }
}

/// `git` command-line client.
#[derive(Debug, Clone)]
pub struct GitClient {
    invoker: Invoker,
}

impl GitClient {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            invoker: Invoker {
                program: "git",
                timeout,
                output_limit_bytes,
            },
        }
    }

    fn in_checkout<'a>(dest: &'a Path, args: &'a [&'a str]) -> Vec<&'a OsStr> {
        let mut full: Vec<&OsStr> = vec![OsStr::new("-C"), dest.as_os_str()];
        full.extend(args.iter().map(OsStr::new));
        full
    }

    /// Apply or clear the sparse filter, reading the profile from `target`.
    fn apply_sparse(&self, request: &VcsRequest<'_>, target: &str) -> Result<(), VcsFailure> {
        let dest = request.dest;
        match request.sparse_profile {
            Some(profile) => {
                let object = format!("{target}:{}", pathspec(profile));
                let patterns = self
                    .invoker
                    .run(request, Self::in_checkout(dest, &["show", object.as_str()]), None)?;
                self.invoker.run(
                    request,
                    Self::in_checkout(dest, &["sparse-checkout", "set", "--no-cone", "--stdin"]),
                    Some(&patterns.stdout),
                )?;
            }
            None if dest.join(".git/info/sparse-checkout").exists() => {
                self.invoker.run(
                    request,
                    Self::in_checkout(dest, &["sparse-checkout", "disable"]),
                    None,
                )?;
            }
            None => {}
        }
        Ok(())
    }
}

impl VcsClient for GitClient {
    #[instrument(skip_all, fields(dest = %request.dest.display(), action = ?request.action))]
    fn sync(&self, request: &VcsRequest<'_>) -> Result<String, VcsFailure> {
        let dest = request.dest;
        if request.action == CheckoutAction::FreshClone {
            self.invoker.run(request, git_clone_args(request), None)?;
        }

        let target = match request.revision {
            Some(revision) => {
                self.invoker.run(
                    request,
                    Self::in_checkout(dest, &["fetch", "--no-tags", "origin", revision]),
                    None,
                )?;
                "FETCH_HEAD"
            }
            None if request.action == CheckoutAction::Update => {
                self.invoker.run(
                    request,
                    Self::in_checkout(dest, &["fetch", "--no-tags", "origin", "HEAD"]),
                    None,
                )?;
                "FETCH_HEAD"
            }
            None => "HEAD",
        };

        self.apply_sparse(request, target)?;
        self.invoker.run(
            request,
            Self::in_checkout(dest, &["checkout", "--force", "--detach", target]),
            None,
        )?;
        let head = self
            .invoker
            .run(request, Self::in_checkout(dest, &["rev-parse", "HEAD"]), None)?;
        Ok(head.stdout_lossy().trim().to_string())
    }
}

/// Arguments of the initial `git clone`.
pub fn git_clone_args(request: &VcsRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["clone".into(), "--no-checkout".into()];
    if request.sparse_profile.is_some() {
        args.push("--filter=blob:none".into());
    }
    args.push("--".into());
    args.push(request.source_url.into());
    args.push(request.dest.as_os_str().to_owned());
    args
}

/// `hg robustcheckout` client.
#[derive(Debug, Clone)]
pub struct HgClient {
    invoker: Invoker,
}

impl HgClient {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            invoker: Invoker {
                program: "hg",
                timeout,
                output_limit_bytes,
            },
        }
    }
}

impl VcsClient for HgClient {
    #[instrument(skip_all, fields(dest = %request.dest.display(), action = ?request.action))]
    fn sync(&self, request: &VcsRequest<'_>) -> Result<String, VcsFailure> {
        let args = hg_checkout_args(request)?;
        self.invoker.run(request, args, None)?;
        let node = self.invoker.run(
            request,
            [
                OsStr::new("-R"),
                request.dest.as_os_str(),
                OsStr::new("log"),
                OsStr::new("-r"),
                OsStr::new("."),
                OsStr::new("-T"),
                OsStr::new("{node}"),
            ],
            None,
        )?;
        Ok(node.stdout_lossy().trim().to_string())
    }
}

/// Arguments of `hg robustcheckout`. Clone and update are the same command;
/// robustcheckout reuses an existing destination.
pub fn hg_checkout_args(request: &VcsRequest<'_>) -> Result<Vec<OsString>, VcsFailure> {
    let store = request.store_path.ok_or_else(|| VcsFailure::Other {
        message: "hg checkouts need a shared store path".to_string(),
    })?;
    let mut args: Vec<OsString> = Vec::new();
    for value in request.hg_config {
        args.push("--config".into());
        args.push(value.into());
    }
    args.push("robustcheckout".into());
    args.push("--sharebase".into());
    args.push(store.as_os_str().to_owned());
    args.push("--purge".into());
    if let Some(base) = request.base_url {
        args.push("--upstream".into());
        args.push(base.into());
    }
    match request.revision {
        Some(revision) => {
            args.push("--revision".into());
            args.push(revision.into());
        }
        None => {
            args.push("--branch".into());
            args.push("default".into());
        }
    }
    if let Some(profile) = request.sparse_profile {
        args.push("--sparseprofile".into());
        args.push(pathspec(profile).into());
    }
    args.push("--".into());
    args.push(request.source_url.into());
    args.push(request.dest.as_os_str().to_owned());
    Ok(args)
}

fn pathspec(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Temporary SSH configuration for checkouts: the pinned `known_hosts` and,
/// when configured, a private key. Removed when dropped.
#[derive(Debug)]
pub struct SshMaterial {
    _dir: TempDir,
    known_hosts: PathBuf,
    key: Option<PathBuf>,
}

impl SshMaterial {
    pub fn provision(
        known_hosts: &str,
        private_key: Option<&str>,
        run_as: &RunAs,
    ) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("run-task-ssh").tempdir()?;
        let known_hosts_path = dir.path().join("known_hosts");
        let mut contents = known_hosts.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        fs::write(&known_hosts_path, contents)?;

        let key = match private_key {
            Some(material) => {
                let path = dir.path().join("id_task");
                let mut material = material.to_string();
                if !material.ends_with('\n') {
                    material.push('\n');
                }
                fs::write(&path, material)?;
                restrict_to_owner(&path)?;
                run_as.hand_over(&path)?;
                Some(path)
            }
            None => None,
        };

        run_as.hand_over(&known_hosts_path)?;
        run_as.hand_over(dir.path())?;
        Ok(Self {
            _dir: dir,
            known_hosts: known_hosts_path,
            key,
        })
    }

    /// `ssh` invocation pinned to the provisioned host keys.
    pub fn ssh_command(&self) -> String {
        let mut command = format!(
            "ssh -o UserKnownHostsFile='{}' -o StrictHostKeyChecking=yes",
            self.known_hosts.display()
        );
        if let Some(key) = &self.key {
            command.push_str(&format!(" -o IdentitiesOnly=yes -i '{}'", key.display()));
        }
        command
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
