//! Cache ownership and volume emptiness checks.
//!
//! Caches persist across tasks on a worker. The first task that touches a
//! cache records its UID/GID in a marker file; every later task must run with
//! the same identity. Mismatches are reported, never repaired: the cause is a
//! Docker image or task configuration that has to be fixed at the source.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::marker::{CacheMarker, MARKER_FILE};
use crate::core::types::{CacheEntry, VolumeDeclaration};
use crate::io::privilege::RunAs;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache was established by a task running as a different identity.
    #[error(
        "cache {path} was established for uid={expected_uid} gid={expected_gid}, \
         but this task runs as uid={actual_uid} gid={actual_gid}"
    )]
    Mismatch {
        path: PathBuf,
        expected_uid: u32,
        expected_gid: u32,
        actual_uid: u32,
        actual_gid: u32,
    },

    #[error("cache marker {path} is unreadable: {reason}")]
    UnreadableMarker { path: PathBuf, reason: String },

    #[error("cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {path} is not empty")]
    NotEmpty { path: PathBuf },

    #[error("volume {path} does not exist")]
    Missing { path: PathBuf },

    #[error("volume {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What [`check_caches`] found for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// First use: the marker was written by this run.
    Established,
    /// The marker matched the task identity.
    Verified,
}

/// Split a `;`-separated path list (`TASKCLUSTER_CACHES` style).
pub fn parse_path_list(raw: Option<&str>) -> Vec<PathBuf> {
    raw.unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Verify (or establish) the ownership marker of every cache, in order.
///
/// Stops at the first mismatch.
#[instrument(skip_all, fields(caches = entries.len()))]
pub fn check_caches(
    entries: &[CacheEntry],
    run_as: &RunAs,
) -> Result<Vec<CacheState>, CacheError> {
    let mut states = Vec::with_capacity(entries.len());
    for entry in entries {
        states.push(check_cache(entry, run_as)?);
    }
    Ok(states)
}

fn check_cache(entry: &CacheEntry, run_as: &RunAs) -> Result<CacheState, CacheError> {
    let marker_path = entry.path.join(MARKER_FILE);
    if let Some(marker) = read_marker(&marker_path)? {
        compare(entry, marker)?;
        debug!(path = %entry.path.display(), "cache marker matches");
        return Ok(CacheState::Verified);
    }

    let io_err = |source| CacheError::Io {
        path: entry.path.clone(),
        source,
    };
    fs::create_dir_all(&entry.path).map_err(io_err)?;
    if has_entries(&entry.path).map_err(io_err)? {
        warn!(
            path = %entry.path.display(),
            "cache has content but no marker; adopting it"
        );
    }

    let marker = CacheMarker {
        uid: entry.expected_uid,
        gid: entry.expected_gid,
    };
    if !write_marker_if_absent(&marker_path, &marker).map_err(io_err)? {
        // Another task established the cache between our read and write.
        let theirs = read_marker(&marker_path)?.ok_or_else(|| CacheError::UnreadableMarker {
            path: marker_path.clone(),
            reason: "marker vanished after concurrent creation".to_string(),
        })?;
        compare(entry, theirs)?;
        return Ok(CacheState::Verified);
    }

    run_as.hand_over(&entry.path).map_err(io_err)?;
    run_as.hand_over(&marker_path).map_err(io_err)?;
    info!(
        path = %entry.path.display(),
        uid = marker.uid,
        gid = marker.gid,
        "established cache marker"
    );
    Ok(CacheState::Established)
}

fn read_marker(path: &Path) -> Result<Option<CacheMarker>, CacheError> {
    match fs::read_to_string(path) {
        Ok(raw) => CacheMarker::parse(&raw)
            .map(Some)
            .map_err(|reason| CacheError::UnreadableMarker {
                path: path.to_path_buf(),
                reason,
            }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn compare(entry: &CacheEntry, marker: CacheMarker) -> Result<(), CacheError> {
    if marker.uid == entry.expected_uid && marker.gid == entry.expected_gid {
        return Ok(());
    }
    Err(CacheError::Mismatch {
        path: entry.path.clone(),
        expected_uid: marker.uid,
        expected_gid: marker.gid,
        actual_uid: entry.expected_uid,
        actual_gid: entry.expected_gid,
    })
}

/// Write the marker only if none exists. Returns false when another writer won.
///
/// The content goes to a temp file first and is hard-linked into place, so
/// readers never observe a partially written marker.
fn write_marker_if_absent(path: &Path, marker: &CacheMarker) -> std::io::Result<bool> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp_path, marker.render())?;
    let linked = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

fn has_entries(path: &Path) -> std::io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_some())
}

/// Ensure every declared volume exists and is empty. Returns the volumes
/// that were checked.
///
/// A path that is also a cache is skipped: caches are expected to hold data.
#[instrument(skip_all, fields(volumes = volumes.len()))]
pub fn check_volumes(
    volumes: &[VolumeDeclaration],
    caches: &[PathBuf],
    run_as: &RunAs,
) -> Result<Vec<PathBuf>, VolumeError> {
    let mut checked = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let path = &volume.path;
        if caches.contains(path) {
            warn!(path = %path.display(), "path is both a cache and a volume; skipping volume check");
            continue;
        }
        let non_empty = match has_entries(path) {
            Ok(non_empty) => non_empty,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(VolumeError::Missing { path: path.clone() });
            }
            Err(source) => {
                return Err(VolumeError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };
        if non_empty {
            return Err(VolumeError::NotEmpty { path: path.clone() });
        }
        run_as.hand_over(path).map_err(|source| VolumeError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "volume is empty");
        checked.push(path.clone());
    }
    Ok(checked)
}
