//! Deterministic classification of VCS client failures.
//!
//! The checkout coordinator only sees an exit status and stderr; the exit
//! code to report depends on whether the failure is worth retrying.

use std::sync::LazyLock;

use regex::RegexSet;

/// Why a VCS command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network trouble; retrying the task may succeed.
    TransientNetwork,
    /// The requested revision does not exist upstream.
    RevisionNotFound,
    /// Anything else.
    Other,
}

static NETWORK_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)could not resolve host",
        r"(?i)temporary failure in name resolution",
        r"(?i)connection (timed out|reset|refused)",
        r"(?i)operation timed out",
        r"(?i)early eof",
        r"(?i)the remote end hung up unexpectedly",
        r"(?i)unable to access '.*'",
        r"(?i)rpc failed",
        r"(?i)ssl_error|tls.*(handshake|alert)",
        r"(?i)http error 5\d\d",
        r"(?i)abort: error: .*(timed out|reset by peer|unreachable)",
        r"(?i)stream ended unexpectedly",
    ])
    .expect("network patterns are valid")
});

static REVISION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)couldn't find remote ref",
        r"(?i)not our ref",
        r"(?i)did not match any",
        r"(?i)unknown revision",
        r"(?i)reference is not a tree",
        r"(?i)abort: unknown revision",
        r"(?i)filtered revision",
    ])
    .expect("revision patterns are valid")
});

/// Classify a failed VCS command from its stderr.
///
/// Revision patterns win over network ones: a missing ref is reported over
/// an otherwise healthy connection.
pub fn classify_vcs_failure(stderr: &str) -> FailureClass {
    if REVISION_PATTERNS.is_match(stderr) {
        FailureClass::RevisionNotFound
    } else if NETWORK_PATTERNS.is_match(stderr) {
        FailureClass::TransientNetwork
    } else {
        FailureClass::Other
    }
}
