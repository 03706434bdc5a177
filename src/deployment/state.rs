/// Persisted record of what the provider runtime holds after a run
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::resource::{PropertyMap, TypeTag, Urn};

/// State file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

/// One resource as the runtime last reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resolved inputs that were sent
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    /// Provider variables the resource was last created or updated with
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl DeploymentState {
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            updated_at: Utc::now(),
            resources: Vec::new(),
        }
    }

    /// Load state from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))
    }

    /// Load state if the file exists
    pub fn load_if_exists<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Write state as pretty JSON, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write state file {}", path.display()))
    }

    pub fn record(&self, urn: &Urn) -> Option<&ResourceRecord> {
        self.resources.iter().find(|r| &r.urn == urn)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Cluster;
    use serde_json::json;
    use tempfile::TempDir;

    fn record() -> ResourceRecord {
        let mut outputs = PropertyMap::new();
        outputs.insert("name".to_string(), json!("kind-example-ab12cd34"));
        ResourceRecord {
            urn: Urn::new("dev", &Cluster::type_tag(), "kind-example"),
            type_tag: Cluster::type_tag(),
            name: "kind-example".to_string(),
            id: Some("kind-example-ab12cd34".to_string()),
            inputs: PropertyMap::new(),
            outputs,
            config: BTreeMap::new(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output").join("state.json");

        let mut state = DeploymentState::new("dev");
        state.resources.push(record());
        state.save(&path).unwrap();

        let loaded = DeploymentState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.record(&record().urn).unwrap().id.as_deref(),
            Some("kind-example-ab12cd34")
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["resources"][0]["type"], "kind:cluster:Cluster");
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(DeploymentState::load_if_exists(&path).unwrap().is_none());

        std::fs::write(&path, "{ not json").unwrap();
        let err = DeploymentState::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }
}
