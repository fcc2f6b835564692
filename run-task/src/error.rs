//! Run-level error aggregation and exit-code mapping.

use thiserror::Error;

use crate::cli::DeclarationError;
use crate::core::types::ExitOutcome;
use crate::io::cache::{CacheError, VolumeError};
use crate::io::checkout::CheckoutError;
use crate::io::privilege::PrivilegeError;
use crate::messages::{CACHE_UID_GID_MISMATCH, non_empty_volume};

/// Everything that can end a run before the task exits on its own.
#[derive(Debug, Error)]
pub enum RunTaskError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error("no task command given; pass it after `--`")]
    MissingCommand,

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    State(String),
}

impl RunTaskError {
    /// The single outcome this failure is reported as.
    pub fn outcome(&self) -> ExitOutcome {
        use std::io::ErrorKind;

        match self {
            Self::Declaration(_) | Self::Config(_) | Self::MissingCommand => {
                ExitOutcome::ConfigurationDefect
            }
            Self::Privilege(err) => match err {
                PrivilegeError::UnknownUserOrGroup { .. } => ExitOutcome::ConfigurationDefect,
                PrivilegeError::InsufficientCapability { .. } => ExitOutcome::PrivilegeError,
                PrivilegeError::Lookup { .. } => ExitOutcome::Internal,
            },
            Self::Cache(err) => match err {
                CacheError::Mismatch { .. } | CacheError::UnreadableMarker { .. } => {
                    ExitOutcome::CachePurgeRequired
                }
                CacheError::Io { .. } => ExitOutcome::Internal,
            },
            Self::Volume(err) => match err {
                VolumeError::NotEmpty { .. } | VolumeError::Missing { .. } => {
                    ExitOutcome::ConfigurationDefect
                }
                VolumeError::Io { .. } => ExitOutcome::Internal,
            },
            Self::Checkout(err) => match err {
                CheckoutError::ScriptMissing { .. }
                | CheckoutError::ConflictingPaths(_)
                | CheckoutError::NotACheckout { .. }
                | CheckoutError::EnclosesWorkingDirectory { .. }
                | CheckoutError::ClientMissing { .. }
                | CheckoutError::RevisionNotFound { .. }
                | CheckoutError::SparseProfileInvalid { .. }
                | CheckoutError::MissingStorePath { .. }
                | CheckoutError::SecretMalformed { .. } => ExitOutcome::ConfigurationDefect,
                CheckoutError::TransientNetwork { .. } | CheckoutError::SecretUnavailable { .. } => {
                    ExitOutcome::TransientInfra
                }
                CheckoutError::PermissionDenied { .. } => ExitOutcome::PrivilegeError,
                CheckoutError::FetchContentFailed { code } => ExitOutcome::from_child_code(*code),
                CheckoutError::Failed { .. } | CheckoutError::Io { .. } => ExitOutcome::Internal,
            },
            Self::Launch { source, .. } => match source.kind() {
                ErrorKind::NotFound => ExitOutcome::TaskFailure(127),
                ErrorKind::PermissionDenied => ExitOutcome::PrivilegeError,
                _ => ExitOutcome::Internal,
            },
            Self::State(_) => ExitOutcome::Internal,
        }
    }

    /// Operator-facing text: the error plus the policy explanation, if any.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Cache(CacheError::Mismatch { .. }) => {
                format!("error: {self}\n{CACHE_UID_GID_MISMATCH}")
            }
            Self::Volume(VolumeError::NotEmpty { path }) => {
                non_empty_volume(&path.display().to_string())
            }
            // Already phrased as an operator error.
            Self::Checkout(CheckoutError::ScriptMissing { .. }) => self.to_string(),
            _ => format!("error: {self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::exit_codes;

    #[test]
    fn cache_failures_require_purge() {
        let mismatch = RunTaskError::from(CacheError::Mismatch {
            path: PathBuf::from("/builds/cache"),
            expected_uid: 1000,
            expected_gid: 1000,
            actual_uid: 500,
            actual_gid: 500,
        });
        assert_eq!(mismatch.outcome().code(), exit_codes::PURGE_CACHE);
        assert!(mismatch.diagnostic().contains("UID/GID mismatch"));

        let unreadable = RunTaskError::from(CacheError::UnreadableMarker {
            path: PathBuf::from("/builds/cache/.cacherequires"),
            reason: "garbage".to_string(),
        });
        assert_eq!(unreadable.outcome(), ExitOutcome::CachePurgeRequired);
    }

    #[test]
    fn non_empty_volume_is_a_configuration_defect() {
        let err = RunTaskError::from(VolumeError::NotEmpty {
            path: PathBuf::from("/builds/worker/workspace"),
        });
        assert_eq!(err.outcome().code(), exit_codes::CONFIGURATION);
        assert!(
            err.diagnostic()
                .contains("volume /builds/worker/workspace is not empty")
        );
    }

    #[test]
    fn checkout_failures_by_cause() {
        let transient = RunTaskError::from(CheckoutError::TransientNetwork {
            key: "vcs".to_string(),
            detail: "reset".to_string(),
        });
        assert_eq!(transient.outcome().code(), exit_codes::TRANSIENT);

        let missing = RunTaskError::from(CheckoutError::ScriptMissing {
            path: PathBuf::from("fetch-content"),
        });
        assert_eq!(missing.outcome().code(), exit_codes::CONFIGURATION);
        let diagnostic = missing.diagnostic();
        assert!(diagnostic.starts_with("error: fetch-content script not found"));
        assert!(!diagnostic.contains("error: error:"));

        let foreign = RunTaskError::from(CheckoutError::NotACheckout {
            key: "vcs".to_string(),
            repo_type: crate::core::types::RepoType::Git,
            path: PathBuf::from("/builds/worker/data"),
        });
        assert_eq!(foreign.outcome().code(), exit_codes::CONFIGURATION);
        let aliased = RunTaskError::from(CheckoutError::ConflictingPaths(vec![
            "tools: checkout path src is already used by another repository".to_string(),
        ]));
        assert_eq!(aliased.outcome().code(), exit_codes::CONFIGURATION);

        let fetch = RunTaskError::from(CheckoutError::FetchContentFailed { code: 4 });
        assert_eq!(fetch.outcome(), ExitOutcome::TaskFailure(4));
    }

    #[test]
    fn privilege_failures_by_cause() {
        let unknown = RunTaskError::from(PrivilegeError::UnknownUserOrGroup {
            user: "ghost".to_string(),
            group: "ghost".to_string(),
            kind: "user",
            name: "ghost".to_string(),
        });
        assert_eq!(unknown.outcome().code(), exit_codes::CONFIGURATION);

        let capability = RunTaskError::from(PrivilegeError::InsufficientCapability {
            user: "worker".to_string(),
            reason: "effective uid is 1000, not 0".to_string(),
        });
        assert_eq!(capability.outcome().code(), exit_codes::PRIVILEGE);
    }

    #[test]
    fn launch_failures() {
        let missing = RunTaskError::Launch {
            program: "nope".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(missing.outcome().code(), 127);
        assert_eq!(
            RunTaskError::MissingCommand.outcome().code(),
            exit_codes::CONFIGURATION
        );
    }
}
