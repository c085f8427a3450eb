//! Service configuration
//!
//! All configuration lives in `$APP_HOME/.conf/config.ini`. `APP_HOME`
//! must point at an existing directory; a missing variable or an
//! unparsable file aborts startup before any connection is accepted.
//!
//! Values may reference `$HOME`, `$USER` and `$SCWD` (the process working
//! directory); references are expanded when the file is read.

use crate::error::{Error, Result};
use ini::Ini;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Relative location of the main config file under `APP_HOME`.
const CONFIG_RELATIVE_PATH: &str = ".conf/config.ini";

pub const DEFAULT_COORDINATOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_COORDINATOR_PORT: u16 = 50200;
const DEFAULT_NUM_THREADS: usize = 2;
const DEFAULT_SCHEDULER_SLOTS: usize = 2;

/// Parsed configuration for both roles.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory `APP_HOME` points at.
    pub app_home: PathBuf,
    /// Number of I/O runtime threads.
    pub num_threads: usize,
    /// Host the coordinator binds (and workers dial by default).
    pub coordinator_host: String,
    /// Port of the coordinator's worker-manager listener.
    pub worker_manager_port: u16,
    /// Whether RA-TLS is enabled for this deployment.
    pub enable_ratls: bool,
    /// Expected MRENCLAVE, hex encoded (64 chars).
    pub mrenclave: Option<String>,
    /// Expected MRSIGNER, hex encoded (64 chars).
    pub mrsigner: Option<String>,
    /// Certificate chain for plain-TLS mode, PEM.
    pub tls_cert_path: Option<PathBuf>,
    /// Private key for plain-TLS mode, PEM.
    pub tls_key_path: Option<PathBuf>,
    /// Storage engine selector (`filesystem` or `ledgebase`).
    pub storage_engine: String,
    /// Install prefix of the ledgebase blob store.
    pub ledgebase_base_path: Option<PathBuf>,
    /// Data directory of the ledgebase blob store.
    pub ledgebase_storage_path: Option<PathBuf>,
    /// Worker-pool capacity of the scheduler.
    pub scheduler_slots: usize,
    /// Whether the scheduler checks manifest compatibility before reuse.
    pub scheduler_compat_check: bool,
}

impl Settings {
    /// Loads configuration from `$APP_HOME/.conf/config.ini`.
    pub fn load() -> Result<Self> {
        let app_home = std::env::var("APP_HOME")
            .map_err(|_| Error::Config("APP_HOME is not set".to_string()))?;
        let app_home = PathBuf::from(app_home);
        if !app_home.is_dir() {
            return Err(Error::Config(format!(
                "APP_HOME is not a valid directory: {}",
                app_home.display()
            )));
        }

        let path = app_home.join(CONFIG_RELATIVE_PATH);
        Self::from_file(&app_home, &path)
    }

    /// Loads configuration from an explicit file path.
    pub fn from_file(app_home: &Path, path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded config");

        let get = |section: &str, key: &str| -> Option<String> {
            ini.get_from(Some(section), key).map(expand_value)
        };

        let num_threads = match get("env", "num_threads") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("env.num_threads: {}", e)))?,
            None => DEFAULT_NUM_THREADS,
        };

        let worker_manager_port = match get("coordinator", "worker_manager_port") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("coordinator.worker_manager_port: {}", e)))?,
            None => DEFAULT_COORDINATOR_PORT,
        };

        let scheduler_slots = match get("scheduler", "num_slot") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("scheduler.num_slot: {}", e)))?,
            None => DEFAULT_SCHEDULER_SLOTS,
        };

        Ok(Self {
            app_home: app_home.to_path_buf(),
            num_threads,
            coordinator_host: get("coordinator", "host")
                .unwrap_or_else(|| DEFAULT_COORDINATOR_HOST.to_string()),
            worker_manager_port,
            enable_ratls: get("ratls", "enable_ratls")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            mrenclave: get("ratls", "mrenclave"),
            mrsigner: get("ratls", "mrsigner"),
            tls_cert_path: get("tls", "cert_path").map(PathBuf::from),
            tls_key_path: get("tls", "key_path").map(PathBuf::from),
            storage_engine: get("storage", "storage_engine")
                .unwrap_or_else(|| "filesystem".to_string()),
            ledgebase_base_path: get("storage_ledgebase", "base_path").map(PathBuf::from),
            ledgebase_storage_path: get("storage_ledgebase", "storage_path").map(PathBuf::from),
            scheduler_slots,
            scheduler_compat_check: get("scheduler", "compat_check")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expands `$HOME`, `$USER` and `$SCWD` references in a config value.
fn expand_value(raw: &str) -> String {
    let mut value = raw.to_string();
    if let Ok(home) = std::env::var("HOME") {
        value = value.replace("$HOME", &home);
    }
    if let Ok(user) = std::env::var("USER") {
        value = value.replace("$USER", &user);
    }
    if let Ok(cwd) = std::env::current_dir() {
        value = value.replace("$SCWD", &cwd.to_string_lossy());
    }
    value
}
