//! Controller configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Issue `clear_cache(type)` after a commit that reached the store
    #[serde(default)]
    pub clear_cache_after_commit: bool,

    /// Page size used when loading a record by id
    #[serde(default = "default_load_page")]
    pub load_page_size: usize,
}

fn default_load_page() -> usize {
    1
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            clear_cache_after_commit: false,
            load_page_size: default_load_page(),
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| EngineError::Schema(e.to_string()))
    }

    pub fn with_cache_clearing(mut self) -> Self {
        self.clear_cache_after_commit = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = ControllerConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert!(!config.clear_cache_after_commit);
        assert_eq!(config.load_page_size, 1);
    }

    #[test]
    fn test_cache_clearing_opt_in() {
        let config = ControllerConfig::from_yaml_str("clear_cache_after_commit: true").unwrap();
        assert!(config.clear_cache_after_commit);
        assert!(ControllerConfig::default().with_cache_clearing().clear_cache_after_commit);
    }
}
