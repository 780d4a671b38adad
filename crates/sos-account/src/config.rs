//! Account configuration.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use sos_engine::{EngineConfig, KeyField};

use crate::error::{AccountError, Result};

/// Configuration for an [`Account`](crate::Account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Human-readable name carried in this device's signed peer info.
    pub device_name: String,
    /// Circle name; becomes a field of every KVS key.
    pub circle_name: String,
    /// Views synchronized by this account, one engine each.
    pub views: Vec<String>,
    /// Settings shared by every engine.
    pub engine: EngineConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            device_name: "device".to_string(),
            circle_name: "keychain".to_string(),
            views: vec!["passwords".to_string()],
            engine: EngineConfig::default(),
        }
    }
}

impl AccountConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| AccountError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AccountError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&json)
    }

    /// Check that names are usable as key fields and views are distinct.
    pub fn validate(&self) -> Result<()> {
        KeyField::new(self.circle_name.as_str())?;
        if self.views.is_empty() {
            return Err(AccountError::Config("at least one view is required".into()));
        }
        let mut seen = BTreeSet::new();
        for view in &self.views {
            if view.is_empty() {
                return Err(AccountError::Config("view names must not be empty".into()));
            }
            if !seen.insert(view) {
                return Err(AccountError::Config(format!("duplicate view {view:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AccountConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AccountConfig::from_json(
            r#"{"device_name": "laptop", "views": ["passwords", "wifi"], "engine": {"queue_depth": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.circle_name, "keychain");
        assert_eq!(config.views, vec!["passwords", "wifi"]);
        assert_eq!(config.engine.queue_depth, 8);
        assert_eq!(config.engine.save_debounce_ms, EngineConfig::default().save_debounce_ms);
    }

    #[test]
    fn test_rejects_bad_circle_name() {
        let err = AccountConfig::from_json(r#"{"circle_name": "my-circle"}"#).unwrap_err();
        assert!(matches!(err, AccountError::Engine(_)));
    }

    #[test]
    fn test_rejects_duplicate_views() {
        assert!(AccountConfig::from_json(r#"{"views": ["a", "a"]}"#).is_err());
        assert!(AccountConfig::from_json(r#"{"views": []}"#).is_err());
        assert!(AccountConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.json");
        std::fs::write(&path, r#"{"device_name": "phone"}"#).unwrap();
        assert_eq!(AccountConfig::from_file(&path).unwrap().device_name, "phone");
        assert!(AccountConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
