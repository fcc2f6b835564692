//! Secrets service access (SSH keys, hg fingerprints).
//!
//! Inside a Taskcluster task the secrets service is reachable through the
//! worker proxy at `http://taskcluster/secrets/v1/secret/<name>` and returns
//! `{"secret": {...}}`.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum SecretError {
    /// The service could not be reached or answered with an error status.
    #[error("secret {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    /// The secret exists but lacks the expected field.
    #[error("secret {name} has no string field '{field}'")]
    Malformed { name: String, field: String },
}

/// Source of named secrets.
pub trait SecretStore {
    /// Fetch the JSON document stored under `name`.
    fn fetch(&self, name: &str) -> Result<Value, SecretError>;
}

/// Read `secret.<field>` as a string from a secrets service document.
pub fn secret_field(name: &str, document: &Value, field: &str) -> Result<String, SecretError> {
    document
        .get("secret")
        .and_then(|secret| secret.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SecretError::Malformed {
            name: name.to_string(),
            field: field.to_string(),
        })
}

/// Secrets service client over the Taskcluster proxy.
pub struct TaskclusterSecrets {
    base_url: String,
    http_client: reqwest::blocking::Client,
}

impl TaskclusterSecrets {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SecretError> {
        let http_client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|error| SecretError::Unavailable {
                name: "<client>".to_string(),
                reason: error.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.into(),
            http_client,
        })
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), name)
    }
}

impl SecretStore for TaskclusterSecrets {
    #[instrument(skip(self))]
    fn fetch(&self, name: &str) -> Result<Value, SecretError> {
        let unavailable = |reason: String| SecretError::Unavailable {
            name: name.to_string(),
            reason,
        };
        let url = self.url_for(name);
        debug!(%url, "fetching secret");
        let response = self
            .http_client
            .get(&url)
            .send()
            .map_err(|error| unavailable(error.to_string()))?
            .error_for_status()
            .map_err(|error| unavailable(error.to_string()))?;
        response
            .json::<Value>()
            .map_err(|error| unavailable(format!("invalid JSON: {error}")))
    }
}
