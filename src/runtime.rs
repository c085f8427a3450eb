//! Component execution runtime
//!
//! Executes one component in a worker's sandbox and captures the
//! environment manifest the scheduler uses for compatibility decisions.
//! The runtime reports the finished component id and the time it spent on
//! I/O as an explicit return value.

use crate::enckey::ContentKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Environment variable the runtime exports for at-rest encryption of the
/// component's working directory.
const CONTENT_KEY_ENV: &str = "SC_CONTENT_KEY";

/// Result of one component execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentOutcome {
    pub finished_id: String,
    /// Seconds the component spent on I/O.
    pub io_time: f64,
}

/// Interface between the worker core and the sandbox runtime.
#[async_trait]
pub trait ComponentRuntime: Send + Sync {
    /// Runs one component to completion in `working_directory`.
    ///
    /// `key` carries the content-encryption key for this component, if
    /// one was configured.
    async fn execute_component(
        &self,
        component_id: &str,
        working_directory: &Path,
        argv: &[String],
        key: Option<&ContentKey>,
    ) -> Result<ComponentOutcome>;

    /// Captures the current environment manifest as JSON. `worker_id` is
    /// attached so the coordinator can index manifests by worker.
    async fn capture_manifest(&self, worker_id: &str) -> Result<String>;
}

/// Runtime that executes components as child processes.
#[derive(Debug, Default)]
pub struct ProcessRuntime;

impl ProcessRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ComponentRuntime for ProcessRuntime {
    async fn execute_component(
        &self,
        component_id: &str,
        working_directory: &Path,
        argv: &[String],
        key: Option<&ContentKey>,
    ) -> Result<ComponentOutcome> {
        let program = argv
            .first()
            .ok_or_else(|| Error::Runtime("empty component command".to_string()))?;

        info!(
            component_id,
            working_directory = %working_directory.display(),
            command = %argv.join(" "),
            "Executing component"
        );

        let mut command = tokio::process::Command::new(program);
        command
            .args(&argv[1..])
            .current_dir(working_directory)
            .env_remove(CONTENT_KEY_ENV);
        if let Some(key) = key {
            command.env(CONTENT_KEY_ENV, hex::encode(key.as_bytes()));
        }

        let started = Instant::now();
        let status = command
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("cannot spawn {}: {}", program, e)))?;
        let io_time = started.elapsed().as_secs_f64();

        if !status.success() {
            return Err(Error::Runtime(format!(
                "component {} exited with {}",
                component_id, status
            )));
        }

        debug!(component_id, io_time, "Component finished");
        Ok(ComponentOutcome {
            finished_id: component_id.to_string(),
            io_time,
        })
    }

    async fn capture_manifest(&self, worker_id: &str) -> Result<String> {
        let manifest = serde_json::json!({
            "worker_id": worker_id,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
        });
        Ok(manifest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_component_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = ProcessRuntime::new();
        let outcome = runtime
            .execute_component(
                "c1",
                dir.path(),
                &["sh".to_string(), "-c".to_string(), "true".to_string()],
                None,
            )
            .await
            .expect("execute");

        assert_eq!(outcome.finished_id, "c1");
        assert!(outcome.io_time >= 0.0);
    }

    #[tokio::test]
    async fn test_execute_component_failure_is_runtime_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = ProcessRuntime::new();
        let err = runtime
            .execute_component(
                "c1",
                dir.path(),
                &["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
                None,
            )
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn test_key_exported_to_component() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = ProcessRuntime::new();
        let key = ContentKey::derive("secret");
        let expected = hex::encode(key.as_bytes());

        let script = format!(r#"test "${}" = "{}""#, CONTENT_KEY_ENV, expected);
        runtime
            .execute_component(
                "c1",
                dir.path(),
                &["sh".to_string(), "-c".to_string(), script],
                Some(&key),
            )
            .await
            .expect("key should be visible to the component");
    }

    #[tokio::test]
    async fn test_manifest_carries_worker_id() {
        let runtime = ProcessRuntime::new();
        let manifest = runtime.capture_manifest("W1").await.expect("manifest");
        let parsed: serde_json::Value = serde_json::from_str(&manifest).expect("json");
        assert_eq!(parsed["worker_id"], serde_json::json!("W1"));
    }
}
