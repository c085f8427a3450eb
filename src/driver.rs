//! Trial driver
//!
//! Drives one pipeline lifecycle against the coordinator: load the named
//! pipeline manifest from `$APP_HOME/exp/`, register its components, then
//! submit them in order. Each submission blocks until the component is
//! done, so the pipeline executes strictly sequentially.

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One component entry in a pipeline manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestComponent {
    pub name: String,
    pub id: String,
    pub working_directory: String,
    pub command: Vec<String>,
}

/// A pipeline manifest as stored under `$APP_HOME/exp/<name>.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineManifest {
    pub name: String,
    pub components: Vec<ManifestComponent>,
}

impl PipelineManifest {
    /// Loads `<app_home>/exp/<manifest_name>.json`.
    pub fn load(app_home: &Path, manifest_name: &str) -> Result<Self> {
        let path = app_home.join("exp").join(format!("{}.json", manifest_name));
        Self::load_path(&path)
    }

    pub fn load_path(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let manifest: Self = serde_json::from_str(&body)
            .map_err(|e| Error::Config(format!("bad manifest {}: {}", path.display(), e)))?;
        if manifest.components.is_empty() {
            return Err(Error::Config(format!(
                "manifest {} has no components",
                path.display()
            )));
        }
        Ok(manifest)
    }
}

/// Runs pipeline lifecycles against one coordinator.
pub struct TrialDriver {
    coordinator: Arc<Coordinator>,
    app_home: PathBuf,
}

impl TrialDriver {
    pub fn new(coordinator: Arc<Coordinator>, app_home: impl Into<PathBuf>) -> Self {
        Self {
            coordinator,
            app_home: app_home.into(),
        }
    }

    /// Executes the named pipeline from start to finish.
    pub async fn on_new_lifecycle(&self, manifest_name: &str) -> Result<()> {
        let manifest = PipelineManifest::load(&self.app_home, manifest_name)?;
        info!(
            pipeline = %manifest.name,
            components = manifest.components.len(),
            "Starting pipeline"
        );

        let names = manifest
            .components
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let ids = manifest.components.iter().map(|c| c.id.clone()).collect();
        self.coordinator.on_new_pipeline(names, ids).await?;

        for component in &manifest.components {
            debug!(component_id = %component.id, "Submitting component");

            let mut info = vec![
                component.id.clone(),
                component.working_directory.clone(),
            ];
            info.extend(component.command.iter().cloned());

            let io_time = self.coordinator.on_new_component(info).await?;
            info!(
                component_id = %component.id,
                io_time,
                "Component finished"
            );
        }

        info!(pipeline = %manifest.name, "Pipeline complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = dir.path().join("exp");
        std::fs::create_dir_all(&exp).expect("mkdir");
        std::fs::write(
            exp.join("mnist.json"),
            r#"{
                "name": "mnist",
                "components": [
                    {
                        "name": "train",
                        "id": "c1",
                        "working_directory": "/tmp/train",
                        "command": ["python", "train.py"]
                    }
                ]
            }"#,
        )
        .expect("write");

        let manifest = PipelineManifest::load(dir.path(), "mnist").expect("load");
        assert_eq!(manifest.name, "mnist");
        assert_eq!(manifest.components.len(), 1);
        assert_eq!(manifest.components[0].command, ["python", "train.py"]);
    }

    #[test]
    fn test_missing_manifest_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = PipelineManifest::load(dir.path(), "ghost").expect_err("missing");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"name": "empty", "components": []}"#).expect("write");
        assert!(PipelineManifest::load_path(&path).is_err());
    }
}
