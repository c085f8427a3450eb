//! Error types for the pipeline service

use thiserror::Error;

/// Errors that can occur in the coordinator or a worker
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or unparsable message. Closes the offending
    /// connection; other connections are unaffected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or TLS failure on a single connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Quote verification failure, measurement mismatch, or a missing
    /// attestation library/device. Rejects the handshake.
    #[error("Attestation error: {0}")]
    Attestation(String),

    /// Missing APP_HOME, unreadable or unparsable config.
    #[error("Config error: {0}")]
    Config(String),

    /// The scheduler could not resolve a worker or pipeline state.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Component execution failed in the runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Unable to bind the listen port or initialize the TLS context.
    #[error("Init error: {0}")]
    Init(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
