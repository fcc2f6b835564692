//! Checkout coordinator: brings every declared repository to its revision,
//! one at a time in declaration order, then runs fetch-content.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{FailureClass, classify_vcs_failure};
use crate::core::invariants::{normalize, validate_descriptors};
use crate::core::types::{RepoType, RepositoryDescriptor, Revision};
use crate::io::config::RunTaskConfig;
use crate::io::privilege::RunAs;
use crate::io::secrets::{SecretError, SecretStore, secret_field};
use crate::io::supervisor::{SupervisorOptions, supervise};
use crate::io::vcs::{
    CheckoutAction, GitClient, HgClient, SshMaterial, VcsClient, VcsFailure, VcsRequest,
};
use crate::messages::FETCH_CONTENT_NOT_FOUND;
use crate::status::StatusLog;

/// Field holding the private key in an SSH secret.
pub const SSH_KEY_FIELD: &str = "ssh_privkey";
/// Field holding the fingerprints in the hg fingerprint secret.
pub const HG_FINGERPRINT_FIELD: &str = "fingerprints";

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("{} (looked for {})", FETCH_CONTENT_NOT_FOUND.trim(), .path.display())]
    ScriptMissing { path: PathBuf },

    #[error("{key}: {program} is not installed")]
    ClientMissing { key: String, program: String },

    #[error("{key}: {program} could not be started as the task user")]
    PermissionDenied { key: String, program: String },

    #[error("{key}: revision {revision} not found upstream: {detail}")]
    RevisionNotFound {
        key: String,
        revision: String,
        detail: String,
    },

    #[error("{key}: network failure during checkout: {detail}")]
    TransientNetwork { key: String, detail: String },

    #[error("{key}: checkout failed: {detail}")]
    Failed { key: String, detail: String },

    #[error("{key}: sparse profile {} must be a relative path inside the repository", .profile.display())]
    SparseProfileInvalid { key: String, profile: PathBuf },

    #[error("invalid repository declaration: {}", .0.join("; "))]
    ConflictingPaths(Vec<String>),

    #[error(
        "{key}: {} has content but is not a {repo_type} checkout; refusing to replace it",
        .path.display()
    )]
    NotACheckout {
        key: String,
        repo_type: RepoType,
        path: PathBuf,
    },

    #[error("{key}: checkout path {} contains the working directory", .path.display())]
    EnclosesWorkingDirectory { key: String, path: PathBuf },

    #[error("{key}: hg checkouts require HG_STORE_PATH")]
    MissingStorePath { key: String },

    #[error("{name}: secret unavailable: {reason}")]
    SecretUnavailable { name: String, reason: String },

    #[error("{name}: secret has no string field '{field}'")]
    SecretMalformed { name: String, field: String },

    #[error("fetch-content exited with status {code}")]
    FetchContentFailed { code: i32 },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SecretError> for CheckoutError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::Unavailable { name, reason } => Self::SecretUnavailable { name, reason },
            SecretError::Malformed { name, field } => Self::SecretMalformed { name, field },
        }
    }
}

/// Outcome of one repository checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    pub key: String,
    /// Absolute checkout path.
    pub checkout_path: PathBuf,
    pub action: CheckoutAction,
    /// Revision reported by the client after the checkout.
    pub revision: String,
}

/// One client per repository type.
pub struct VcsClients {
    pub git: Box<dyn VcsClient>,
    pub hg: Box<dyn VcsClient>,
}

impl VcsClients {
    pub fn from_config(config: &RunTaskConfig) -> Self {
        let timeout = Duration::from_secs(config.vcs_timeout_secs);
        Self {
            git: Box::new(GitClient::new(timeout, config.vcs_output_limit_bytes)),
            hg: Box::new(HgClient::new(timeout, config.vcs_output_limit_bytes)),
        }
    }

    pub fn for_type(&self, repo_type: RepoType) -> &dyn VcsClient {
        match repo_type {
            RepoType::Git => self.git.as_ref(),
            RepoType::Hg => self.hg.as_ref(),
        }
    }
}

/// Everything the coordinator needs besides the descriptors.
pub struct CheckoutContext<'a> {
    pub config: &'a RunTaskConfig,
    pub working_directory: &'a Path,
    pub run_as: &'a RunAs,
    pub clients: &'a VcsClients,
    pub secrets: &'a dyn SecretStore,
    pub status: &'a StatusLog,
    /// `HG_STORE_PATH`.
    pub hg_store_path: Option<&'a Path>,
    /// `MOZ_FETCHES`; fetch-content runs when non-empty.
    pub fetches: Option<&'a str>,
    pub fetch_hg_fingerprint: bool,
    pub supervisor: SupervisorOptions,
}

/// Check out every descriptor in order, then run fetch-content if fetches
/// are declared. Stops at the first failure.
#[instrument(skip_all, fields(repositories = descriptors.len()))]
pub fn checkout_all(
    descriptors: &[RepositoryDescriptor],
    ctx: &CheckoutContext<'_>,
) -> Result<Vec<CheckoutResult>, CheckoutError> {
    let problems = validate_descriptors(descriptors, ctx.working_directory);
    if !problems.is_empty() {
        return Err(CheckoutError::ConflictingPaths(problems));
    }

    let mut fingerprint: Option<String> = None;
    let mut results = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if descriptor.repo_type == RepoType::Hg && ctx.fetch_hg_fingerprint && fingerprint.is_none()
        {
            fingerprint = Some(fetch_hg_fingerprint(ctx)?);
        }
        results.push(checkout_one(descriptor, ctx, fingerprint.as_deref())?);
    }

    if ctx.fetches.is_some_and(|fetches| !fetches.trim().is_empty()) {
        run_fetch_content(&results, ctx)?;
    }
    Ok(results)
}

fn fetch_hg_fingerprint(ctx: &CheckoutContext<'_>) -> Result<String, CheckoutError> {
    let name = &ctx.config.hg_fingerprint_secret;
    let document = ctx.secrets.fetch(name)?;
    let fingerprints = secret_field(name, &document, HG_FINGERPRINT_FIELD)?;
    ctx.status
        .emit("vcs", &format!("fetched hg.mozilla.org fingerprint {fingerprints}"));
    Ok(fingerprints)
}

/// Absolute checkout path for `descriptor`.
pub fn resolve_checkout_path(descriptor: &RepositoryDescriptor, working_directory: &Path) -> PathBuf {
    if descriptor.checkout_path.is_absolute() {
        descriptor.checkout_path.clone()
    } else {
        working_directory.join(&descriptor.checkout_path)
    }
}

fn validate_sparse_profile(descriptor: &RepositoryDescriptor) -> Result<(), CheckoutError> {
    let Some(profile) = &descriptor.sparse_profile else {
        return Ok(());
    };
    let escapes = profile
        .components()
        .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir));
    if profile.as_os_str().is_empty() || escapes {
        return Err(CheckoutError::SparseProfileInvalid {
            key: descriptor.key.clone(),
            profile: profile.clone(),
        });
    }
    Ok(())
}

fn holds_checkout(path: &Path, repo_type: RepoType) -> bool {
    let marker = match repo_type {
        RepoType::Git => ".git",
        RepoType::Hg => ".hg",
    };
    path.join(marker).exists()
}

/// Decide how to bring `dest` to `revision`. A null revision always means a
/// fresh clone.
pub fn plan_action(revision: &Revision, dest: &Path, repo_type: RepoType) -> CheckoutAction {
    if !revision.is_null() && holds_checkout(dest, repo_type) {
        CheckoutAction::Update
    } else {
        CheckoutAction::FreshClone
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckoutError + '_ {
    move |source| CheckoutError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Clear `dest` for a fresh clone and make sure its parent exists.
///
/// Only a previous checkout of the same type is removed. Anything else with
/// content is left alone and reported.
fn prepare_fresh_clone(
    descriptor: &RepositoryDescriptor,
    dest: &Path,
    ctx: &CheckoutContext<'_>,
) -> Result<(), CheckoutError> {
    if normalize(ctx.working_directory).starts_with(normalize(dest)) {
        return Err(CheckoutError::EnclosesWorkingDirectory {
            key: descriptor.key.clone(),
            path: dest.to_path_buf(),
        });
    }
    if dest.exists() {
        let populated = fs::read_dir(dest)
            .map_err(io_error(dest))?
            .next()
            .is_some();
        if populated {
            if !holds_checkout(dest, descriptor.repo_type) {
                return Err(CheckoutError::NotACheckout {
                    key: descriptor.key.clone(),
                    repo_type: descriptor.repo_type,
                    path: dest.to_path_buf(),
                });
            }
            warn!(path = %dest.display(), "removing previous checkout for a fresh clone");
            fs::remove_dir_all(dest).map_err(io_error(dest))?;
        }
    }
    if let Some(parent) = dest.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
        ctx.run_as.hand_over(parent).map_err(io_error(parent))?;
    }
    Ok(())
}

fn needs_ssh(descriptor: &RepositoryDescriptor) -> bool {
    descriptor.ssh_secret_name.is_some()
        || descriptor.source_url.starts_with("ssh://")
        || descriptor.source_url.starts_with("git@")
}

fn provision_ssh(
    descriptor: &RepositoryDescriptor,
    ctx: &CheckoutContext<'_>,
) -> Result<Option<SshMaterial>, CheckoutError> {
    if !needs_ssh(descriptor) {
        return Ok(None);
    }
    let key = match &descriptor.ssh_secret_name {
        Some(name) => {
            let document = ctx.secrets.fetch(name)?;
            Some(secret_field(name, &document, SSH_KEY_FIELD)?)
        }
        None => None,
    };
    let material = SshMaterial::provision(&ctx.config.known_hosts, key.as_deref(), ctx.run_as)
        .map_err(|source| CheckoutError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
    Ok(Some(material))
}

#[instrument(skip_all, fields(key = %descriptor.key))]
fn checkout_one(
    descriptor: &RepositoryDescriptor,
    ctx: &CheckoutContext<'_>,
    hg_fingerprint: Option<&str>,
) -> Result<CheckoutResult, CheckoutError> {
    validate_sparse_profile(descriptor)?;
    let store_path = match descriptor.repo_type {
        RepoType::Hg => Some(ctx.hg_store_path.ok_or_else(|| {
            CheckoutError::MissingStorePath {
                key: descriptor.key.clone(),
            }
        })?),
        RepoType::Git => None,
    };

    let dest = resolve_checkout_path(descriptor, ctx.working_directory);
    let action = plan_action(&descriptor.revision, &dest, descriptor.repo_type);
    if action == CheckoutAction::FreshClone {
        prepare_fresh_clone(descriptor, &dest, ctx)?;
    }

    let ssh = provision_ssh(descriptor, ctx)?;
    let mut env = Vec::new();
    let mut hg_config = Vec::new();
    if let Some(ssh) = &ssh {
        match descriptor.repo_type {
            RepoType::Git => env.push(("GIT_SSH_COMMAND".to_string(), ssh.ssh_command())),
            RepoType::Hg => hg_config.push(format!("ui.ssh={}", ssh.ssh_command())),
        }
    }
    if let (RepoType::Hg, Some(fingerprints)) = (descriptor.repo_type, hg_fingerprint) {
        hg_config.push(format!(
            "hostsecurity.{}:fingerprints={fingerprints}",
            ctx.config.hg_fingerprint_host
        ));
    }

    ctx.status.emit(
        "vcs",
        &format!(
            "{} of {} at {} into {} ({:?})",
            descriptor.display_name,
            descriptor.source_url,
            descriptor.revision,
            dest.display(),
            action
        ),
    );

    let request = VcsRequest {
        action,
        source_url: &descriptor.source_url,
        base_url: descriptor.base_url.as_deref(),
        revision: descriptor.revision.as_named(),
        dest: &dest,
        sparse_profile: descriptor.sparse_profile.as_deref(),
        store_path,
        hg_config: &hg_config,
        env: &env,
        run_as: ctx.run_as,
    };
    let started = Instant::now();
    let revision = ctx
        .clients
        .for_type(descriptor.repo_type)
        .sync(&request)
        .map_err(|failure| classify_failure(descriptor, failure))?;
    drop(ssh);

    info!(%revision, elapsed_ms = started.elapsed().as_millis() as u64, "checkout complete");
    ctx.status.emit(
        "vcs",
        &format!("{} checked out at {revision}", descriptor.display_name),
    );
    Ok(CheckoutResult {
        key: descriptor.key.clone(),
        checkout_path: dest,
        action,
        revision,
    })
}

/// Map a client failure to the coordinator's error taxonomy.
pub fn classify_failure(descriptor: &RepositoryDescriptor, failure: VcsFailure) -> CheckoutError {
    let key = descriptor.key.clone();
    match failure {
        VcsFailure::ClientMissing { program } => CheckoutError::ClientMissing { key, program },
        VcsFailure::PermissionDenied { program } => {
            CheckoutError::PermissionDenied { key, program }
        }
        VcsFailure::TimedOut { command } => CheckoutError::TransientNetwork {
            key,
            detail: format!("{command} timed out"),
        },
        VcsFailure::Exited { ref stderr, .. } => match classify_vcs_failure(stderr) {
            FailureClass::TransientNetwork => CheckoutError::TransientNetwork {
                key,
                detail: failure.to_string(),
            },
            FailureClass::RevisionNotFound => CheckoutError::RevisionNotFound {
                key,
                revision: descriptor.revision.to_string(),
                detail: stderr.trim().to_string(),
            },
            FailureClass::Other => CheckoutError::Failed {
                key,
                detail: failure.to_string(),
            },
        },
        VcsFailure::Other { message } => CheckoutError::Failed {
            key,
            detail: message,
        },
    }
}

/// Checkout holding fetch-content: key `vcs`, else the first checkout, else
/// the working directory.
pub fn primary_checkout<'a>(results: &'a [CheckoutResult], working_directory: &'a Path) -> &'a Path {
    results
        .iter()
        .find(|result| result.key == "vcs")
        .or_else(|| results.first())
        .map_or(working_directory, |result| result.checkout_path.as_path())
}

fn run_fetch_content(
    results: &[CheckoutResult],
    ctx: &CheckoutContext<'_>,
) -> Result<(), CheckoutError> {
    let script = primary_checkout(results, ctx.working_directory).join(&ctx.config.fetch_content_path);
    if !script.is_file() {
        return Err(CheckoutError::ScriptMissing { path: script });
    }

    ctx.status.emit("fetches", "fetching task artifacts");
    debug!(script = %script.display(), "running fetch-content");
    let mut cmd = Command::new(&script);
    cmd.arg("task-artifacts").current_dir(ctx.working_directory);
    ctx.run_as.configure(&mut cmd);

    let code = supervise(cmd, ctx.status, "fetches", ctx.supervisor).map_err(|source| {
        match source.kind() {
            std::io::ErrorKind::NotFound => CheckoutError::ScriptMissing {
                path: script.clone(),
            },
            std::io::ErrorKind::PermissionDenied => CheckoutError::PermissionDenied {
                key: "fetches".to_string(),
                program: script.display().to_string(),
            },
            _ => CheckoutError::Io {
                path: script.clone(),
                source,
            },
        }
    })?;
    if code != 0 {
        return Err(CheckoutError::FetchContentFailed { code });
    }
    ctx.status.emit("fetches", "fetch-content complete");
    Ok(())
}
