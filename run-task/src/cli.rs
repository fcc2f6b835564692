//! Command line and environment parsing.
//!
//! The repository set comes from `REPOSITORIES` before argument parsing:
//! each key contributes a `--<key>-checkout` and `--<key>-sparse-profile`
//! flag on top of the static [`Cli`] options.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use clap::{Arg, ArgMatches, CommandFactory, FromArgMatches, Parser, value_parser};
use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;

use crate::core::types::{RepoType, RepositoryDescriptor, Revision};
use crate::io::cache::parse_path_list;
use crate::orchestrator::TaskRequest;

/// Repository set used when `REPOSITORIES` is unset.
pub const DEFAULT_REPOSITORIES: &str = r#"{"vcs": "repository"}"#;

static REPOSITORY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("key pattern is valid"));

#[derive(Debug, Parser)]
#[command(
    name = "run-task",
    version,
    about = "Prepare a CI task environment and run the task command"
)]
pub struct Cli {
    /// User to run the task as when invoked as root.
    #[arg(long, default_value = "worker")]
    pub user: String,

    /// Group to run the task as when invoked as root.
    #[arg(long, default_value = "worker")]
    pub group: String,

    /// Directory to run the task command in.
    #[arg(long)]
    pub task_cwd: Option<PathBuf>,

    #[arg(long, hide = true)]
    pub fetch_hgfingerprint: bool,

    /// Optional TOML configuration file.
    #[arg(long, env = "RUN_TASK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Task command, after `--`.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("REPOSITORIES must be a JSON object mapping keys to names: {0}")]
    Malformed(String),

    #[error("invalid repository key '{0}' (expected lowercase letters, digits, '-' or '_')")]
    InvalidKey(String),

    #[error("{key}: {variable} must be set to check out this repository")]
    MissingSource { key: String, variable: String },

    #[error("{key}: {variable}: {reason}")]
    InvalidValue {
        key: String,
        variable: String,
        reason: String,
    },

    #[error("invalid repository declaration: {}", .0.join("; "))]
    Inconsistent(Vec<String>),

    #[error(transparent)]
    Usage(#[from] clap::Error),
}

/// Per-repository flags from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryFlags {
    pub key: String,
    pub display_name: String,
    pub checkout: Option<PathBuf>,
    pub sparse_profile: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Invocation {
    pub cli: Cli,
    pub repositories: Vec<RepositoryFlags>,
}

/// Parse `REPOSITORIES`, preserving declaration order.
pub fn parse_repositories(raw: Option<&str>) -> Result<IndexMap<String, String>, DeclarationError> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .unwrap_or(DEFAULT_REPOSITORIES);
    let repositories: IndexMap<String, String> =
        serde_json::from_str(raw).map_err(|err| DeclarationError::Malformed(err.to_string()))?;
    if let Some(bad) = repositories.keys().find(|key| !REPOSITORY_KEY.is_match(key)) {
        return Err(DeclarationError::InvalidKey(bad.clone()));
    }
    Ok(repositories)
}

/// Environment variable prefix of a repository key.
pub fn env_prefix(key: &str) -> String {
    key.to_uppercase().replace('-', "_")
}

fn checkout_id(key: &str) -> String {
    format!("{key}-checkout")
}

fn sparse_id(key: &str) -> String {
    format!("{key}-sparse-profile")
}

/// The static CLI plus one flag pair per declared repository.
pub fn build_command(repositories: &IndexMap<String, String>) -> clap::Command {
    repositories
        .iter()
        .fold(Cli::command(), |cmd, (key, name)| {
            cmd.arg(
                Arg::new(checkout_id(key))
                    .long(checkout_id(key))
                    .value_name("DIR")
                    .value_parser(value_parser!(PathBuf))
                    .help(format!("Directory where the {name} should be checked out")),
            )
            .arg(
                Arg::new(sparse_id(key))
                    .long(sparse_id(key))
                    .value_name("PROFILE")
                    .value_parser(value_parser!(PathBuf))
                    .help(format!("Sparse profile of the {name} checkout")),
            )
        })
}

/// Parse `args` (including the program name) against the declared set.
pub fn parse_args<I, T>(
    args: I,
    repositories: &IndexMap<String, String>,
) -> Result<Invocation, DeclarationError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = build_command(repositories).try_get_matches_from(args)?;
    let cli = Cli::from_arg_matches(&matches)?;
    let repositories = repositories
        .iter()
        .map(|(key, name)| repository_flags(&matches, key, name))
        .collect();
    Ok(Invocation { cli, repositories })
}

fn repository_flags(matches: &ArgMatches, key: &str, name: &str) -> RepositoryFlags {
    RepositoryFlags {
        key: key.to_string(),
        display_name: name.to_string(),
        checkout: matches.get_one::<PathBuf>(&checkout_id(key)).cloned(),
        sparse_profile: matches.get_one::<PathBuf>(&sparse_id(key)).cloned(),
    }
}

fn non_empty<'a>(env: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    env.get(name).map(String::as_str).filter(|value| !value.trim().is_empty())
}

/// Descriptors for every repository with a `--<key>-checkout` flag, in
/// declaration order. Repositories without one are skipped.
pub fn build_descriptors(
    invocation: &Invocation,
    env: &BTreeMap<String, String>,
) -> Result<Vec<RepositoryDescriptor>, DeclarationError> {
    let mut descriptors = Vec::new();
    for flags in &invocation.repositories {
        let Some(checkout_path) = flags.checkout.clone() else {
            continue;
        };
        let prefix = env_prefix(&flags.key);
        let invalid = |variable: String, reason: String| DeclarationError::InvalidValue {
            key: flags.key.clone(),
            variable,
            reason,
        };

        let head_variable = format!("{prefix}_HEAD_REPOSITORY");
        let source_url = non_empty(env, &head_variable)
            .ok_or_else(|| DeclarationError::MissingSource {
                key: flags.key.clone(),
                variable: head_variable.clone(),
            })?
            .to_string();

        let rev_variable = format!("{prefix}_HEAD_REV");
        let revision = Revision::parse(env.get(&rev_variable).map(String::as_str))
            .map_err(|reason| invalid(rev_variable.clone(), reason))?;

        let type_variable = format!("{prefix}_REPOSITORY_TYPE");
        let repo_type = match non_empty(env, &type_variable) {
            Some(raw) => raw
                .parse::<RepoType>()
                .map_err(|reason| invalid(type_variable.clone(), reason))?,
            None => RepoType::Git,
        };

        descriptors.push(RepositoryDescriptor {
            key: flags.key.clone(),
            display_name: flags.display_name.clone(),
            checkout_path,
            sparse_profile: flags.sparse_profile.clone(),
            revision,
            source_url,
            base_url: non_empty(env, &format!("{prefix}_BASE_REPOSITORY")).map(str::to_string),
            repo_type,
            ssh_secret_name: non_empty(env, &format!("{prefix}_SSH_SECRET_NAME"))
                .map(str::to_string),
        });
    }

    // Relative aliases only; absolute ones are caught once the working
    // directory is known.
    let problems = crate::core::invariants::validate_descriptors(&descriptors, Path::new(""));
    if !problems.is_empty() {
        return Err(DeclarationError::Inconsistent(problems));
    }
    Ok(descriptors)
}

/// Assemble the orchestrator's request from the parsed command line and an
/// environment snapshot.
pub fn task_request(
    invocation: &Invocation,
    env: &BTreeMap<String, String>,
) -> Result<TaskRequest, DeclarationError> {
    let cli = &invocation.cli;
    Ok(TaskRequest {
        user: cli.user.clone(),
        group: cli.group.clone(),
        descriptors: build_descriptors(invocation, env)?,
        caches: parse_path_list(env.get("TASKCLUSTER_CACHES").map(String::as_str)),
        volumes: parse_path_list(env.get("TASKCLUSTER_VOLUMES").map(String::as_str)),
        command: cli.command.clone(),
        task_cwd: cli.task_cwd.clone(),
        hg_store_path: non_empty(env, "HG_STORE_PATH").map(PathBuf::from),
        fetches: non_empty(env, "MOZ_FETCHES").map(str::to_string),
        fetch_hg_fingerprint: cli.fetch_hgfingerprint,
    })
}
