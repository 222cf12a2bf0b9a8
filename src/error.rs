// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the registry engine.
//!
//! Errors are categorized by their source (adapter, SQLite, lease store, etc.)
//! and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transfer` | Yes | Adapter fetch failed (network/timeout on payload transfer) |
//! | `ChecksumCompute` | Yes | Checksum calculation failed (distinct from a mismatch) |
//! | `Lease` | Yes | Lease store unreachable or command failed |
//! | `RegistryStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `UnknownResourceType` | No | No adapter registered for a registry's resource type |
//! | `InvalidTransition` | No | Registry state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retryable errors become `failed` registry
//! rows with a `retry_at` gate; non-retryable errors indicate bugs or
//! configuration problems and are surfaced to the caller instead.
//!
//! A checksum mismatch is deliberately NOT an error variant. It is a detected
//! consistency violation recorded on the registry row and re-queued for sync;
//! see [`crate::registry::VerificationOutcome`].

use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating or verifying resources.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Payload transfer failed.
    ///
    /// Raised by a [`Replicable`](crate::replicable::Replicable) adapter's
    /// `fetch`. Typically transient (network timeouts, primary overloaded),
    /// so the registry row is failed with backoff and retried.
    #[error("Transfer error ({resource}): {message}")]
    Transfer { resource: String, message: String },

    /// Checksum calculation failed.
    ///
    /// Raised while computing a primary or replica digest. Distinct from a
    /// checksum mismatch: this is an execution failure, retried like a
    /// transfer error with its own bounded retry count.
    #[error("Checksum computation error ({resource}): {message}")]
    ChecksumCompute { resource: String, message: String },

    /// Lease store command failed.
    ///
    /// The lease store (Redis in production) was unreachable or returned an
    /// error. Retryable; the work item is simply picked up again on a later
    /// scheduling pass.
    #[error("Lease error ({operation}): {message}")]
    Lease { operation: String, message: String },

    /// SQLite error from the registry store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Registry store error: {0}")]
    RegistryStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A registry row references a resource type with no registered adapter.
    ///
    /// Not retryable - the adapter map is fixed at startup, so this is a
    /// deployment mismatch (e.g. rows left behind by a removed adapter).
    #[error("No adapter registered for resource type '{0}'")]
    UnknownResourceType(String),

    /// Registry state machine violation.
    ///
    /// An operation was attempted on a row in the wrong state (e.g. finishing
    /// a sync that was never started). Not retryable - indicates a bug in the
    /// caller, since engines re-check eligibility under the lease.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during shutdown.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transfer error.
    pub fn transfer(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a checksum computation error.
    pub fn checksum(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChecksumCompute {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a lease error.
    pub fn lease(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lease {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-transition error from state names.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { .. } => true,
            Self::ChecksumCompute { .. } => true,
            Self::Lease { .. } => true,
            Self::RegistryStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::UnknownResourceType(_) => false,
            Self::InvalidTransition { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::lease("command", e.to_string())
    }
}
