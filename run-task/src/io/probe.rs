//! Environment probe: platform, invoking identity, working directory.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::core::types::Platform;

/// Read-only snapshot of the process environment taken at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentReport {
    pub platform: Platform,
    /// Real UID as a decimal string; absent when it cannot be determined.
    pub current_uid: Option<String>,
    pub current_gid: Option<String>,
    pub current_user: Option<String>,
    pub working_directory: PathBuf,
}

/// Probe the running process.
///
/// `platform` is supplied by the caller (normally [`Platform::current`]).
/// Never fails: an unreadable working directory degrades to `.`.
pub fn probe(platform: Platform) -> EnvironmentReport {
    let working_directory = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!(err = %err, "cannot determine working directory, using '.'");
            PathBuf::from(".")
        }
    };
    let (current_uid, current_gid, current_user) = current_identity();
    debug!(%platform, uid = ?current_uid, user = ?current_user, "probed environment");
    EnvironmentReport {
        platform,
        current_uid,
        current_gid,
        current_user,
        working_directory,
    }
}

#[cfg(unix)]
fn current_identity() -> (Option<String>, Option<String>, Option<String>) {
    use nix::unistd::{User, getgid, getuid};

    let uid = getuid();
    let user = match User::from_uid(uid) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(err) => {
            warn!(err = %err, uid = uid.as_raw(), "passwd lookup failed");
            None
        }
    };
    (Some(uid.to_string()), Some(getgid().to_string()), user)
}

#[cfg(not(unix))]
fn current_identity() -> (Option<String>, Option<String>, Option<String>) {
    let user = std::env::var("USERNAME").ok();
    (None, None, user)
}
