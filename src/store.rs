//! Versioned blob-store integration
//!
//! The coordinator can persist pipeline artifacts in an external
//! versioned key-value blob store (the "ledgebase" engine). The store
//! runs out of process; this module only exports the environment the
//! store's tooling expects and defines the interface the core consumes.

use crate::config::Settings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Storage engine name that enables the blob store.
pub const LEDGEBASE_ENGINE: &str = "ledgebase";

/// Exports the `USTORE_*` environment expected by the blob-store tooling.
///
/// Only meaningful when `[storage] storage_engine` selects the ledgebase
/// engine; paths are derived from `[storage_ledgebase]`.
pub fn install_env(settings: &Settings) -> Result<()> {
    let base = settings
        .ledgebase_base_path
        .as_ref()
        .ok_or_else(|| Error::Config("storage_ledgebase.base_path is not set".to_string()))?;
    let storage = settings
        .ledgebase_storage_path
        .as_ref()
        .ok_or_else(|| Error::Config("storage_ledgebase.storage_path is not set".to_string()))?;

    debug!(
        base_path = %base.display(),
        storage_path = %storage.display(),
        "Installing blob-store environment"
    );

    std::env::set_var("USTORE_HOME", base);
    std::env::set_var("USTORE_BIN", base.join("bin"));
    std::env::set_var("USTORE_CONF", base.join("conf"));
    std::env::set_var("USTORE_CONF_DATA_DIR", storage);
    std::env::set_var("USTORE_CONF_FILE", base.join("conf/config.cfg"));
    std::env::set_var("USTORE_CONF_HOST_FILE", base.join("conf/workers.lst"));
    std::env::set_var("USTORE_LOG", base.join("log"));

    debug!("Blob-store environment variables set");
    Ok(())
}

/// Interface to the versioned blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches a value by key, at a branch head or a specific version.
    async fn get(
        &self,
        key: &str,
        branch: Option<&str>,
        version: Option<&str>,
    ) -> Result<Vec<u8>>;

    /// Stores a value on a branch and returns the new version id.
    async fn put(&self, key: &str, branch: &str, value: &[u8]) -> Result<String>;
}
