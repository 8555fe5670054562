//! Host directory: resolves host ids to connection credentials.
//!
//! The orchestrator only ever reads from the directory, and only when a worker
//! claims a job. Managing the records themselves belongs to whatever store
//! backs the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{FleetError, LookupError};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    IdentityFile(PathBuf),
    /// Rely on the ssh agent or the client's default keys
    None,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Secret::Password(_) => write!(f, "Password(<redacted>)"),
            Secret::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            Secret::None => write!(f, "None"),
        }
    }
}

/// Everything needed to open a session against one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCredentials {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub secret: Secret,
}

#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn resolve(&self, host_id: &str) -> Result<HostCredentials, LookupError>;
}

/// One entry of the host inventory file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostRecord {
    id: String,
    #[serde(alias = "ip")]
    address: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl From<HostRecord> for HostCredentials {
    fn from(record: HostRecord) -> Self {
        let secret = match (record.identity_file, record.password) {
            (Some(path), _) => Secret::IdentityFile(path),
            (None, Some(password)) if !password.is_empty() => Secret::Password(password),
            _ => Secret::None,
        };
        Self {
            host_id: record.id,
            address: record.address,
            port: record.port,
            username: record.username,
            secret,
        }
    }
}

/// Fixed inventory held in memory, typically loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    hosts: HashMap<String, HostCredentials>,
}

impl StaticDirectory {
    pub fn new(hosts: impl IntoIterator<Item = HostCredentials>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| (h.host_id.clone(), h))
                .collect(),
        }
    }

    /// Parse a JSON array of host records.
    pub fn from_json(json: &str) -> Result<Self, FleetError> {
        let records: Vec<HostRecord> = serde_json::from_str(json)
            .map_err(|e| FleetError::Validation(format!("invalid host inventory: {}", e)))?;
        Ok(Self::new(records.into_iter().map(HostCredentials::from)))
    }

    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let json = std::fs::read_to_string(path)?;
        let directory = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), hosts = directory.len(), "Loaded host inventory");
        Ok(directory)
    }

    /// Host ids in sorted order.
    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl HostDirectory for StaticDirectory {
    async fn resolve(&self, host_id: &str) -> Result<HostCredentials, LookupError> {
        self.hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(host_id.to_string()))
    }
}
