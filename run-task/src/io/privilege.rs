//! Resolving and applying the identity spawned processes run as.
//!
//! The orchestrator itself never changes identity. Every process it spawns on
//! behalf of the task (VCS clients, fetch-content, the task command) is
//! configured with the same [`RunAs`], so files created in checkouts and
//! caches belong to the task user.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::privilege::{PrivilegeDecision, is_privileged_invoker};
use crate::core::types::TaskIdentity;
use crate::io::probe::EnvironmentReport;

/// Errors from privilege resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrivilegeError {
    /// The configured run-as user or group does not exist on this host.
    #[error("cannot run as {user}:{group}: {kind} '{name}' does not exist on this host")]
    UnknownUserOrGroup {
        user: String,
        group: String,
        kind: &'static str,
        name: String,
    },

    /// De-escalation is required but this process cannot switch identity.
    #[error("cannot drop privileges to {user}: {reason}")]
    InsufficientCapability { user: String, reason: String },

    /// The user database itself failed.
    #[error("lookup of {kind} '{name}' failed: {reason}")]
    Lookup {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

/// A passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: Option<PathBuf>,
}

/// Source of user and group information.
pub trait UserDatabase {
    fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, String>;
    fn group_by_name(&self, name: &str) -> Result<Option<u32>, String>;
    /// Effective UID of the orchestrator, when the platform has one.
    fn effective_uid(&self) -> Option<u32>;
}

/// User database backed by the host's passwd/group files.
pub struct SystemUserDatabase;

#[cfg(unix)]
impl UserDatabase for SystemUserDatabase {
    fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, String> {
        let user = nix::unistd::User::from_name(name).map_err(|err| err.to_string())?;
        Ok(user.map(|user| UserRecord {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: Some(user.dir),
        }))
    }

    fn group_by_name(&self, name: &str) -> Result<Option<u32>, String> {
        let group = nix::unistd::Group::from_name(name).map_err(|err| err.to_string())?;
        Ok(group.map(|group| group.gid.as_raw()))
    }

    fn effective_uid(&self) -> Option<u32> {
        Some(nix::unistd::geteuid().as_raw())
    }
}

#[cfg(not(unix))]
impl UserDatabase for SystemUserDatabase {
    fn user_by_name(&self, _name: &str) -> Result<Option<UserRecord>, String> {
        Ok(None)
    }

    fn group_by_name(&self, _name: &str) -> Result<Option<u32>, String> {
        Ok(None)
    }

    fn effective_uid(&self) -> Option<u32> {
        None
    }
}

/// Turn a decision into the concrete identity the task runs as.
///
/// Without de-escalation the task keeps the invoking identity. With it, the
/// target user and group must exist and the orchestrator must really be
/// root (a UID of 0 inside an unprivileged namespace is not enough).
#[instrument(skip_all, fields(user = %decision.target_user, group = %decision.target_group))]
pub fn resolve<U: UserDatabase + ?Sized>(
    decision: &PrivilegeDecision,
    report: &EnvironmentReport,
    users: &U,
) -> Result<TaskIdentity, PrivilegeError> {
    if !decision.must_deescalate {
        return Ok(current_identity(report));
    }

    let unknown = |kind: &'static str, name: &str| PrivilegeError::UnknownUserOrGroup {
        user: decision.target_user.clone(),
        group: decision.target_group.clone(),
        kind,
        name: name.to_string(),
    };

    let user = users
        .user_by_name(&decision.target_user)
        .map_err(|reason| PrivilegeError::Lookup {
            kind: "user",
            name: decision.target_user.clone(),
            reason,
        })?
        .ok_or_else(|| unknown("user", &decision.target_user))?;
    let gid = users
        .group_by_name(&decision.target_group)
        .map_err(|reason| PrivilegeError::Lookup {
            kind: "group",
            name: decision.target_group.clone(),
            reason,
        })?
        .ok_or_else(|| unknown("group", &decision.target_group))?;

    match users.effective_uid() {
        Some(0) => {}
        Some(euid) => {
            return Err(PrivilegeError::InsufficientCapability {
                user: user.name,
                reason: format!("effective uid is {euid}, not 0"),
            });
        }
        None => {
            return Err(PrivilegeError::InsufficientCapability {
                user: user.name,
                reason: "platform has no effective uid".to_string(),
            });
        }
    }

    info!(uid = user.uid, gid, "task will run de-escalated");
    Ok(TaskIdentity {
        run_as_user: user.name,
        run_as_group: decision.target_group.clone(),
        is_privileged_invoker: true,
        uid: Some(user.uid),
        gid: Some(gid),
        home: user.home,
    })
}

fn current_identity(report: &EnvironmentReport) -> TaskIdentity {
    if report.platform.is_posix() && report.current_uid.is_none() {
        warn!("invoking uid is unknown; not attempting de-escalation");
    }
    let uid = parse_id(report.current_uid.as_deref());
    let gid = parse_id(report.current_gid.as_deref());
    let run_as_user = report
        .current_user
        .clone()
        .or_else(|| report.current_uid.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let run_as_group = report
        .current_gid
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    debug!(%run_as_user, ?uid, ?gid, "task keeps invoking identity");
    TaskIdentity {
        run_as_user,
        run_as_group,
        is_privileged_invoker: is_privileged_invoker(
            report.platform,
            report.current_uid.as_deref(),
        ),
        uid,
        gid,
        home: None,
    }
}

fn parse_id(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|raw| raw.parse().ok())
}

/// Spawn-time identity applied to child processes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunAs {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Environment describing the target user (`HOME`, `USER`, `LOGNAME`).
    pub env: Vec<(String, String)>,
}

/// Build the [`RunAs`] for `identity`. Only a privileged invoker switches.
pub fn apply(identity: &TaskIdentity) -> RunAs {
    if !identity.is_privileged_invoker {
        return RunAs::default();
    }
    let mut env = vec![
        ("USER".to_string(), identity.run_as_user.clone()),
        ("LOGNAME".to_string(), identity.run_as_user.clone()),
    ];
    if let Some(home) = &identity.home {
        env.push(("HOME".to_string(), home.display().to_string()));
    }
    RunAs {
        uid: identity.uid,
        gid: identity.gid,
        env,
    }
}

impl RunAs {
    pub fn switches_identity(&self) -> bool {
        self.uid.is_some()
    }

    /// Configure `cmd` to start as this identity.
    pub fn configure(&self, cmd: &mut Command) {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if let Some(gid) = self.gid {
                cmd.gid(gid);
            }
            if let Some(uid) = self.uid {
                cmd.uid(uid);
            }
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
    }

    /// Give `path` (not recursively) to this identity. No-op without a switch.
    pub fn hand_over(&self, path: &Path) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use nix::unistd::{Gid, Uid, chown};
            if let Some(uid) = self.uid {
                chown(
                    path,
                    Some(Uid::from_raw(uid)),
                    self.gid.map(Gid::from_raw),
                )
                .map_err(std::io::Error::from)?;
            }
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }
}
