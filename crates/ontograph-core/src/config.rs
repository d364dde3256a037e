//! Store configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DagError, DagResult};
use crate::trie::DEFAULT_MIN_KEY_LENGTH;

/// Default number of records per snapshot file before sharding kicks in.
pub const DEFAULT_MAX_OBJECTS_PER_FILE: usize = 500_000;

/// Configuration for a store instance. Every field has a default, so a config
/// file only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    /// Snapshot directory. `None` keeps the store purely in memory.
    pub root: Option<PathBuf>,
    /// Records per `nodes.dat`/`edges.dat` file before splitting into shards.
    pub max_objects_per_file: usize,
    /// Alias lookups shorter than this are always exact.
    pub min_alias_length: usize,
    /// Ignore persisted module state and rebuild every index on open.
    pub force_rebuild: bool,
    /// Module type names in registration order, used when the snapshot
    /// directory has no `activeModules.config`.
    pub modules: Vec<String>,
    /// Predicates whose `(pred node "alias")` edges declare aliases.
    pub alias_predicates: Vec<String>,
}

impl Default for DagConfig {
    fn default() -> Self {
        DagConfig {
            root: None,
            max_objects_per_file: DEFAULT_MAX_OBJECTS_PER_FILE,
            min_alias_length: DEFAULT_MIN_KEY_LENGTH,
            force_rebuild: false,
            modules: vec![
                crate::related::RelatedEdgeModule::NAME.to_string(),
                crate::alias::NodeAliasModule::NAME.to_string(),
            ],
            alias_predicates: vec![
                "prettyString".to_string(),
                "synonymousExternalConcept".to_string(),
            ],
        }
    }
}

impl DagConfig {
    /// In-memory default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        DagConfig {
            root: Some(root.into()),
            ..Default::default()
        }
    }

    /// Parse a TOML configuration document.
    pub fn from_toml(text: &str) -> DagResult<Self> {
        let config: DagConfig = toml::from_str(text).map_err(|e| DagError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> DagResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DagError::io(path, e))?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> DagResult<()> {
        if self.max_objects_per_file == 0 {
            return Err(DagError::Config("max_objects_per_file must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DagConfig::from_toml(
            r#"
root = "/var/lib/ontograph"
min_alias_length = 2
"#,
        )
        .unwrap();

        assert_eq!(config.root, Some(PathBuf::from("/var/lib/ontograph")));
        assert_eq!(config.min_alias_length, 2);
        assert_eq!(config.max_objects_per_file, DEFAULT_MAX_OBJECTS_PER_FILE);
        assert_eq!(config.modules, vec!["RelatedEdgeModule", "NodeAliasModule"]);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            DagConfig::from_toml("max_objects_per_file = 0"),
            Err(DagError::Config(_))
        ));
        assert!(matches!(
            DagConfig::from_toml("min_alias_length = \"three\""),
            Err(DagError::Config(_))
        ));
    }
}
