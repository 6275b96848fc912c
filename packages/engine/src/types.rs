use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PERSISTENCE_INTERVAL: Duration = Duration::from_millis(100);

/// `(namespace, name)` pair identifying one replicant within a replicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicantIdentity {
    pub namespace: String,
    pub name: String,
}

impl ReplicantIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ReplicantIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicantStatus {
    Undeclared,
    Declaring,
    Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorRole {
    /// Owns the canonical value, assigns revisions, broadcasts accepted batches.
    Authoritative,
    /// Proposes mutations and converges on authoritative broadcasts.
    Subscriber,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclareOpts {
    pub persistent: bool,
    pub persistence_interval: Duration,
    pub schema_path: Option<PathBuf>,
    pub default_value: Option<serde_json::Value>,
}

impl Default for DeclareOpts {
    fn default() -> Self {
        Self {
            persistent: true,
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
            schema_path: None,
            default_value: None,
        }
    }
}

impl DeclareOpts {
    /// Redeclaring a held name is allowed only when the structural options
    /// agree; `default_value` is intentionally excluded (it only matters for
    /// the first declaration).
    pub(crate) fn conflicts_with(&self, other: &DeclareOpts) -> bool {
        self.persistent != other.persistent || self.schema_path != other.schema_path
    }
}
