//! Cache ownership marker (`.cacherequires`) format.
//!
//! The marker records the UID/GID of the first task that used a cache. The
//! file holds sorted `key=value` lines. Unknown keys are rejected so a newer
//! format is never silently misread.

use std::collections::BTreeMap;

/// File name of the marker inside a cache directory.
pub const MARKER_FILE: &str = ".cacherequires";
/// Marker format version written by this build.
pub const MARKER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMarker {
    pub uid: u32,
    pub gid: u32,
}

impl CacheMarker {
    pub fn render(&self) -> String {
        format!(
            "gid={}\nuid={}\nversion={MARKER_VERSION}\n",
            self.gid, self.uid
        )
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut fields = BTreeMap::new();
        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("malformed marker line '{line}'"))?;
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|_| format!("non-numeric value in marker line '{line}'"))?;
            if fields.insert(key.trim().to_string(), value).is_some() {
                return Err(format!("duplicate marker key '{}'", key.trim()));
            }
        }

        let version = fields.remove("version").unwrap_or(MARKER_VERSION);
        if version != MARKER_VERSION {
            return Err(format!("unsupported marker version {version}"));
        }
        let uid = fields.remove("uid").ok_or("marker has no uid")?;
        let gid = fields.remove("gid").ok_or("marker has no gid")?;
        if let Some(key) = fields.keys().next() {
            return Err(format!("unknown marker key '{key}'"));
        }
        Ok(Self { uid, gid })
    }
}
