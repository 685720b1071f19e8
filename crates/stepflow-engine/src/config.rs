//! Flow configuration: history limits, ordering, prerequisites.

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stepflow_types::Result;

/// Prerequisite graph: step name to the steps that must complete first.
pub type PrerequisiteMap = IndexMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10,
        }
    }
}

/// Serializable configuration for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub history: HistoryConfig,
    /// Explicit step order; wins over prerequisites and declaration order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prerequisites: Option<PrerequisiteMap>,
    /// Quiet period for [`Flow::refresh_availability_debounced`](crate::Flow::refresh_availability_debounced).
    pub refresh_debounce_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            order: None,
            prerequisites: None,
            refresh_debounce_ms: 50,
        }
    }
}

impl FlowConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_prerequisites<I, K, V, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = Some(
            prerequisites
                .into_iter()
                .map(|(k, v)| (k.into(), v.into_iter().map(Into::into).collect()))
                .collect(),
        );
        self
    }

    pub fn with_history(mut self, enabled: bool, max_size: usize) -> Self {
        self.history = HistoryConfig { enabled, max_size };
        self
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FlowConfig::default();
        assert!(config.history.enabled);
        assert_eq!(config.history.max_size, 10);
        assert!(config.order.is_none());
        assert_eq!(config.refresh_debounce(), Duration::from_millis(50));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = FlowConfig::from_json_str(r#"{"history": {"max_size": 3}}"#).unwrap();
        assert!(config.history.enabled);
        assert_eq!(config.history.max_size, 3);
        assert_eq!(config.refresh_debounce_ms, 50);
    }

    #[test]
    fn prerequisites_keep_declaration_order() {
        let config = FlowConfig::from_json_str(
            r#"{"prerequisites": {"review": ["billing"], "billing": ["account"]}}"#,
        )
        .unwrap();
        let keys: Vec<_> = config.prerequisites.unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["review", "billing"]);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(&path, r#"{"order": ["b", "a"], "refresh_debounce_ms": 5}"#).unwrap();

        let config = FlowConfig::load(&path).unwrap();
        assert_eq!(config.order, Some(vec!["b".to_string(), "a".to_string()]));
        assert_eq!(config.refresh_debounce_ms, 5);
    }

    #[test]
    fn builder_helpers() {
        let config = FlowConfig::default()
            .with_order(["a", "b"])
            .with_prerequisites([("b", ["a"])])
            .with_history(false, 0);
        assert_eq!(config.order.unwrap().len(), 2);
        assert_eq!(config.prerequisites.unwrap()["b"], vec!["a".to_string()]);
        assert!(!config.history.enabled);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(FlowConfig::from_json_str("{ nope").is_err());
    }
}
