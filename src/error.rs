//! Error types for the federation engine
//!
//! The taxonomy distinguishes transport-level connection failures from
//! semantic contract violations (a service returned data that does not match
//! its advertised output), soft timeouts, and administrative I/O failures
//! against the statistics store.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the federation engine and its components.
#[derive(Debug, Error)]
pub enum FederationError {
    /// A remote service or endpoint was unreachable or answered with a
    /// non-success status.
    #[error("connection error for {service}: {message}")]
    Connection { service: String, message: String },

    /// A service answered, but its output does not match its advertised
    /// output contract. This is a semantic error, not a transport error.
    #[error("service {service} violated its output contract: {message}")]
    ContractViolation { service: String, message: String },

    /// An operation did not complete within its allotted time. The caller
    /// proceeds as if the call failed; the worker is cancelled cooperatively.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure communicating with the statistics store.
    #[error("stats store I/O error: {0}")]
    Io(String),

    /// Failure consulting the service registry.
    #[error("registry error: {0}")]
    Registry(String),

    /// The query cannot be planned as given.
    #[error("query cannot be planned: {0}")]
    Plan(String),

    /// Task engine failure (illegal transition, pool shutdown, lost worker).
    #[error("task error: {0}")]
    Task(String),

    /// Malformed RDF or SPARQL results payload.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type alias for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;
