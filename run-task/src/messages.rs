//! Operator-facing diagnostics printed when a run aborts.

/// Explains the cache ownership policy after a UID/GID mismatch.
pub const CACHE_UID_GID_MISMATCH: &str = "
There is a UID/GID mismatch on the cache. This likely means:

a) different tasks are running as a different user/group
b) different Docker images have different UID/GID for the same user/group

Our cache policy is that the UID/GID for ALL tasks must be consistent
for the lifetime of the cache. This eliminates permissions problems due
to file/directory user/group ownership.

To make this error go away, ensure that all Docker images use
a consistent UID/GID and that all tasks using this cache are running as
the same user/group.";

/// Explains why a populated volume is rejected.
pub fn non_empty_volume(path: &str) -> String {
    format!(
        "
error: volume {path} is not empty

Our Docker image policy requires volumes to be empty.

The volume was likely populated as part of building the Docker image.
Change the Dockerfile and anything run from it to not create files in
any VOLUME.

A lesser possibility is that you stumbled upon a TaskCluster platform bug
where it fails to use new volumes for tasks."
    )
}

/// Printed when the fetch-content helper is missing from the checkout.
pub const FETCH_CONTENT_NOT_FOUND: &str = "
error: fetch-content script not found

The script at 'taskcluster/scripts/misc/fetch-content' could not be
detected in the current environment.";
