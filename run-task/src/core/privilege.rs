//! De-escalation decision.
//!
//! Whether the task must run as a different user is a pure function of the
//! platform and the invoking UID; looking users up and applying the switch
//! live in `io::privilege`.

/// UID of the superuser on POSIX systems.
pub const SUPERUSER_UID: &str = "0";

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeDecision {
    pub must_deescalate: bool,
    pub target_user: String,
    pub target_group: String,
}

/// Decide whether spawned processes must drop to `user`/`group`.
///
/// True only on POSIX platforms when the invoking UID is the superuser. An
/// unknown UID is treated as unprivileged.
pub fn decide(
    platform: crate::core::types::Platform,
    current_uid: Option<&str>,
    user: &str,
    group: &str,
) -> PrivilegeDecision {
    PrivilegeDecision {
        must_deescalate: is_privileged_invoker(platform, current_uid),
        target_user: user.to_string(),
        target_group: group.to_string(),
    }
}

pub fn is_privileged_invoker(
    platform: crate::core::types::Platform,
    current_uid: Option<&str>,
) -> bool {
    platform.is_posix() && current_uid == Some(SUPERUSER_UID)
}
