//! Pipeline Enclave - coordinator/worker service for attested ML pipelines
//!
//! This library provides the session and dispatch core of the service:
//! - length-prefixed message framing over plaintext, TLS, or RA-TLS
//! - the coordinator's worker registry and serialized pipeline lifecycle
//! - the worker loop that executes components in a sandbox runtime
//! - RA-TLS quote generation and verification behind a provider trait
//! - content-encryption key derivation for component working directories

pub mod attestation;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod enckey;
pub mod error;
pub mod handler;
pub mod message;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod worker;
