//! Test-only fakes and fixtures.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::core::types::{Platform, RepoType, RepositoryDescriptor, Revision};
use crate::io::privilege::{UserDatabase, UserRecord};
use crate::io::probe::EnvironmentReport;
use crate::io::secrets::{SecretError, SecretStore};
use crate::io::vcs::{CheckoutAction, VcsClient, VcsFailure, VcsRequest};

/// Revision reported by [`ScriptedVcsClient`] for null-revision checkouts.
pub const SCRIPTED_HEAD: &str = "1111111111111111111111111111111111111111";

/// In-memory `Write` sink shared between clones.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Git descriptor `key` checked out at `path` with the null revision.
pub fn descriptor(key: &str, path: &str) -> RepositoryDescriptor {
    RepositoryDescriptor {
        key: key.to_string(),
        display_name: format!("{key} repository"),
        checkout_path: PathBuf::from(path),
        sparse_profile: None,
        revision: Revision::Null,
        source_url: format!("https://example.com/{key}"),
        base_url: None,
        repo_type: RepoType::Git,
        ssh_secret_name: None,
    }
}

/// Environment report for `uid` (gid mirrors uid).
pub fn report(platform: Platform, uid: Option<&str>) -> EnvironmentReport {
    EnvironmentReport {
        platform,
        current_uid: uid.map(str::to_string),
        current_gid: uid.map(str::to_string),
        current_user: uid.map(|uid| format!("user{uid}")),
        working_directory: PathBuf::from("/builds/worker"),
    }
}

/// User database with an explicit user table. Effective UID defaults to 0.
#[derive(Debug, Clone)]
pub struct FakeUserDatabase {
    users: HashMap<String, UserRecord>,
    groups: HashMap<String, u32>,
    effective_uid: Option<u32>,
}

impl Default for FakeUserDatabase {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            groups: HashMap::new(),
            effective_uid: Some(0),
        }
    }
}

impl FakeUserDatabase {
    /// Add user `name` and a group of the same name.
    pub fn with_user(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.users.insert(
            name.to_string(),
            UserRecord {
                name: name.to_string(),
                uid,
                gid,
                home: Some(PathBuf::from(format!("/home/{name}"))),
            },
        );
        self.groups.insert(name.to_string(), gid);
        self
    }

    pub fn with_effective_uid(mut self, uid: Option<u32>) -> Self {
        self.effective_uid = uid;
        self
    }
}

impl UserDatabase for FakeUserDatabase {
    fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, String> {
        Ok(self.users.get(name).cloned())
    }

    fn group_by_name(&self, name: &str) -> Result<Option<u32>, String> {
        Ok(self.groups.get(name).copied())
    }

    fn effective_uid(&self) -> Option<u32> {
        self.effective_uid
    }
}

/// One recorded [`ScriptedVcsClient::sync`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCall {
    pub action: CheckoutAction,
    pub source_url: String,
    pub dest: PathBuf,
    pub revision: Option<String>,
    pub sparse_profile: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub hg_config: Vec<String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Vec<SyncCall>,
    failures: Vec<VcsFailure>,
}

/// VCS client that records requests and fakes checkouts on disk.
///
/// A successful sync creates the destination with the client's metadata
/// directory (`.git` or `.hg`), so later runs see an existing checkout.
#[derive(Debug, Clone)]
pub struct ScriptedVcsClient {
    metadata_dir: &'static str,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedVcsClient {
    pub fn git() -> Self {
        Self {
            metadata_dir: ".git",
            state: Arc::default(),
        }
    }

    pub fn hg() -> Self {
        Self {
            metadata_dir: ".hg",
            state: Arc::default(),
        }
    }

    /// Fail the next sync with `failure`. Queued failures apply in order.
    pub fn fail_next(&self, failure: VcsFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(failure);
        }
    }

    pub fn calls(&self) -> Vec<SyncCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }
}

impl VcsClient for ScriptedVcsClient {
    fn sync(&self, request: &VcsRequest<'_>) -> Result<String, VcsFailure> {
        let mut state = self.state.lock().map_err(|_| VcsFailure::Other {
            message: "scripted client poisoned".to_string(),
        })?;
        state.calls.push(SyncCall {
            action: request.action,
            source_url: request.source_url.to_string(),
            dest: request.dest.to_path_buf(),
            revision: request.revision.map(str::to_string),
            sparse_profile: request.sparse_profile.map(PathBuf::from),
            env: request.env.to_vec(),
            hg_config: request.hg_config.to_vec(),
        });
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        std::fs::create_dir_all(request.dest.join(self.metadata_dir)).map_err(|err| {
            VcsFailure::Other {
                message: err.to_string(),
            }
        })?;
        Ok(request.revision.unwrap_or(SCRIPTED_HEAD).to_string())
    }
}

/// Secret store backed by a map. Unknown names are unavailable.
#[derive(Debug, Default)]
pub struct FakeSecrets {
    secrets: HashMap<String, Value>,
    fetches: AtomicUsize,
}

impl FakeSecrets {
    pub fn insert(&mut self, name: &str, document: Value) {
        self.secrets.insert(name.to_string(), document);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SecretStore for FakeSecrets {
    fn fetch(&self, name: &str) -> Result<Value, SecretError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::Unavailable {
                name: name.to_string(),
                reason: "404 Not Found".to_string(),
            })
    }
}
