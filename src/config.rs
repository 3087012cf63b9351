//! Adapter configuration
//!
//! Loaded from `pgdoc.toml`. A `.env` file next to it is read first, and
//! the following environment variables override file settings:
//!
//! - `PGDOC_SCHEMA_TABLE` - metadata table name
//! - `PGDOC_TEXT_LANGUAGE` - default `$text` language
//! - `PGDOC_ESTIMATE_COUNT` - `true`/`false`
//! - `PGDOC_LOG_STATEMENTS` - `true`/`false`

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::sql::predicate::DEFAULT_TEXT_LANGUAGE;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "pgdoc.toml";

pub const ENV_SCHEMA_TABLE: &str = "PGDOC_SCHEMA_TABLE";
pub const ENV_TEXT_LANGUAGE: &str = "PGDOC_TEXT_LANGUAGE";
pub const ENV_ESTIMATE_COUNT: &str = "PGDOC_ESTIMATE_COUNT";
pub const ENV_LOG_STATEMENTS: &str = "PGDOC_LOG_STATEMENTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Table holding one schema document per class
    #[serde(default = "default_schema_table")]
    pub schema_table: String,
    #[serde(default = "default_text_language")]
    pub text_search_language: String,
    /// Answer unfiltered counts from the catalog row estimate
    #[serde(default = "default_true")]
    pub estimate_count: bool,
    /// Width of identifier columns in join tables and the metadata table
    #[serde(default = "default_id_width")]
    pub join_id_width: usize,
    #[serde(default)]
    pub log_statements: bool,
}

fn default_schema_table() -> String {
    "_SCHEMA".to_string()
}

fn default_text_language() -> String {
    DEFAULT_TEXT_LANGUAGE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_id_width() -> usize {
    120
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            schema_table: default_schema_table(),
            text_search_language: default_text_language(),
            estimate_count: true,
            join_id_width: default_id_width(),
            log_statements: false,
        }
    }
}

impl AdapterConfig {
    /// Load `pgdoc.toml` from a directory. A missing file yields the
    /// defaults; environment overrides apply in both cases.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(table) = std::env::var(ENV_SCHEMA_TABLE) {
            if !table.is_empty() {
                self.schema_table = table;
            }
        }

        if let Ok(language) = std::env::var(ENV_TEXT_LANGUAGE) {
            if !language.is_empty() {
                self.text_search_language = language;
            }
        }

        if let Ok(flag) = std::env::var(ENV_ESTIMATE_COUNT) {
            if let Ok(enabled) = flag.parse::<bool>() {
                self.estimate_count = enabled;
            }
        }

        if let Ok(flag) = std::env::var(ENV_LOG_STATEMENTS) {
            if let Ok(enabled) = flag.parse::<bool>() {
                self.log_statements = enabled;
            }
        }
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = AdapterConfig::from_toml("estimate_count = false").unwrap();
        assert_eq!(config.schema_table, "_SCHEMA");
        assert_eq!(config.text_search_language, "english");
        assert!(!config.estimate_count);
        assert_eq!(config.join_id_width, 120);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig {
            text_search_language: "french".to_string(),
            ..Default::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.text_search_language, "french");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.join_id_width, 120);
    }
}
