//! Configuration for the workflow state layer

use std::path::PathBuf;

/// Configuration for opening workflow state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateConfig {
    /// RocksDB directory. None keeps all state in memory.
    pub db_path: Option<PathBuf>,

    /// Create the database if the directory does not hold one yet
    pub create_if_missing: bool,

    /// Prefix for the Prometheus metrics registered by the engine state
    pub metrics_prefix: String,
}

impl StateConfig {
    /// Create a configuration for an ephemeral, in-memory store.
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            create_if_missing: true,
            metrics_prefix: "raftoral".to_string(),
        }
    }

    /// Create a configuration for a RocksDB store at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    /// Fail instead of creating a fresh database when none exists.
    pub fn with_create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    /// Set the metrics prefix.
    pub fn with_metrics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metrics_prefix = prefix.into();
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.db_path.is_some()
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = StateConfig::persistent("/var/lib/raftoral")
            .with_create_if_missing(false)
            .with_metrics_prefix("node_1");

        assert!(config.is_persistent());
        assert!(!config.create_if_missing);
        assert_eq!(config.metrics_prefix, "node_1");
        assert!(!StateConfig::default().is_persistent());
    }
}
