//! Invariants over the declared repository set.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::core::types::RepositoryDescriptor;

/// Check invariants of a descriptor set:
/// - No duplicate keys
/// - No two descriptors share a checkout path once resolved against `base`
///
/// Paths are compared lexically, so `src`, `./src` and `<base>/src` collide.
/// Nested checkouts are allowed; declaration order decides which one lands first.
pub fn validate_descriptors(descriptors: &[RepositoryDescriptor], base: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    let mut keys = HashSet::new();
    let mut paths = HashSet::new();

    for descriptor in descriptors {
        if !keys.insert(descriptor.key.as_str()) {
            errors.push(format!("duplicate repository key '{}'", descriptor.key));
        }
        if !paths.insert(normalize(&base.join(&descriptor.checkout_path))) {
            errors.push(format!(
                "{}: checkout path {} is already used by another repository",
                descriptor.key,
                descriptor.checkout_path.display()
            ));
        }
    }

    errors
}

/// Drop `.` components and fold `..` into its parent without touching the
/// filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}
