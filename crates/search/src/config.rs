//! Search backend configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Search backend and rotation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Elasticsearch node URLs. Empty selects the in-process backend.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
    /// Aliases managed by the rotation and repair jobs.
    #[serde(default = "default_aliases")]
    pub aliases: Vec<String>,
    /// Alias normalized events are written to.
    #[serde(default = "default_write_alias")]
    pub write_alias: String,
    /// An active index older than this is replaced on the next rotation.
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// Superseded indices kept per alias before pruning.
    #[serde(default = "default_retain_superseded")]
    pub retain_superseded: usize,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for document copies between indices, in seconds.
    #[serde(default = "default_reindex_timeout_secs")]
    pub reindex_timeout_secs: u64,
}

fn default_aliases() -> Vec<String> {
    vec![default_write_alias()]
}

fn default_write_alias() -> String {
    "audit-events".to_string()
}

fn default_rotation_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_retain_superseded() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_reindex_timeout_secs() -> u64 {
    240
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            username: None,
            password: None,
            aliases: default_aliases(),
            write_alias: default_write_alias(),
            rotation_interval_secs: default_rotation_interval_secs(),
            retain_superseded: default_retain_superseded(),
            timeout_secs: default_timeout_secs(),
            reindex_timeout_secs: default_reindex_timeout_secs(),
        }
    }
}

impl SearchConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reindex_timeout(&self) -> Duration {
        Duration::from_secs(self.reindex_timeout_secs)
    }

    /// Whether a remote cluster is configured.
    pub fn is_remote(&self) -> bool {
        !self.nodes.is_empty()
    }
}
