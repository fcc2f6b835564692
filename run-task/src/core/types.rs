//! Shared deterministic types for run-task core logic.
//!
//! These types define stable contracts between the probe, privilege, cache,
//! checkout and orchestration stages. They hold no I/O handles and can be
//! constructed freely in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Sentinel revision meaning "no prior revision, create a fresh checkout".
pub const NULL_REVISION: &str = "0000000000000000000000000000000000000000";

/// Operating system family the orchestrator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    MacOsx,
    Windows,
}

impl Platform {
    /// Platform of the running binary.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` value onto a platform family.
    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" => Self::MacOsx,
            "windows" => Self::Windows,
            _ => Self::Posix,
        }
    }

    /// True for the platforms where UID/GID de-escalation applies.
    pub fn is_posix(self) -> bool {
        matches!(self, Self::Posix | Self::MacOsx)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Posix => write!(f, "posix"),
            Self::MacOsx => write!(f, "macosx"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// Version control system backing a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoType {
    Git,
    Hg,
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "git" => Ok(Self::Git),
            "hg" => Ok(Self::Hg),
            other => Err(format!("unknown repository type '{other}' (expected git or hg)")),
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Hg => write!(f, "hg"),
        }
    }
}

/// Requested revision of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// No revision pinned: always a fresh clone of the default head.
    Null,
    /// 40-hex node or symbolic name (branch, tag).
    Named(String),
}

impl Revision {
    /// Parse an optional revision value. Unset, empty and the all-zero
    /// sentinel all mean [`Revision::Null`].
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(Self::Null);
        };
        if raw == NULL_REVISION {
            return Ok(Self::Null);
        }
        if raw.starts_with('-') || raw.chars().any(char::is_whitespace) {
            return Err(format!("invalid revision '{raw}'"));
        }
        Ok(Self::Named(raw.to_string()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_named(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "{NULL_REVISION}"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One repository the task asked to have checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    /// Stable identifier from the repository declaration (e.g. `vcs`).
    pub key: String,
    /// Human readable name used in help text and logs.
    pub display_name: String,
    pub checkout_path: PathBuf,
    /// Repository-relative path of the sparse profile, if any.
    pub sparse_profile: Option<PathBuf>,
    pub revision: Revision,
    pub source_url: String,
    /// Upstream repository used for object sharing (hg `--upstream`).
    pub base_url: Option<String>,
    pub repo_type: RepoType,
    /// Secrets-service name holding an SSH private key for this repository.
    pub ssh_secret_name: Option<String>,
}

/// Identity the task command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub run_as_user: String,
    pub run_as_group: String,
    /// True when invoked as root on a POSIX platform.
    pub is_privileged_invoker: bool,
    /// `None` when the platform or the probe could not tell.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: Option<PathBuf>,
}

impl TaskIdentity {
    /// Numeric uid and gid, when both are known.
    pub fn ids(&self) -> Option<(u32, u32)> {
        Some((self.uid?, self.gid?))
    }
}

/// A persistent cache directory and the ownership it must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub expected_uid: u32,
    pub expected_gid: u32,
}

/// A mount volume that must be empty when the task starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDeclaration {
    pub path: PathBuf,
}

/// Fully prepared child process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    /// Variables added on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
    pub run_as: TaskIdentity,
}

/// Final classification of a run, surfaced as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Child exited non-zero; carries the code to propagate.
    TaskFailure(i32),
    CachePurgeRequired,
    ConfigurationDefect,
    TransientInfra,
    PrivilegeError,
    Internal,
}

impl ExitOutcome {
    /// Outcome mirroring a child's exit code.
    pub fn from_child_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::TaskFailure(code)
        }
    }

    pub fn code(self) -> i32 {
        use crate::exit_codes;
        match self {
            Self::Success => exit_codes::OK,
            Self::TaskFailure(code) => code,
            Self::CachePurgeRequired => exit_codes::PURGE_CACHE,
            Self::ConfigurationDefect => exit_codes::CONFIGURATION,
            Self::TransientInfra => exit_codes::TRANSIENT,
            Self::PrivilegeError => exit_codes::PRIVILEGE,
            Self::Internal => exit_codes::INTERNAL,
        }
    }
}
