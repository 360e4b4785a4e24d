//! Reflink provisioner error types.
//!
//! All errors in the `libreflink` crate are represented by the
//! [`ReflinkError`] enum.  Reconciliation code isolates them per item: a
//! failed claim, request or directory is logged and retried on the next pass,
//! so most variants are never fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ReflinkError>;

/// Unified error type for provisioner operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum ReflinkError {
    /// The orchestrator store rejected or failed a call.
    #[error("store error: {0}")]
    Store(String),

    /// The object being created already exists in the store.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind, e.g. `PersistentVolume`.
        kind: String,
        /// Object name.
        name: String,
    },

    /// The referenced object does not exist in the store.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind, e.g. `VolumeSnapshot`.
        kind: String,
        /// Object name.
        name: String,
    },

    /// A copy / remove / existence check failed on a host.
    #[error("{op} failed on {host} for {path}: {reason}")]
    Exec {
        /// Operation name (`exists`, `clone`, `remove`).
        op: String,
        /// Host the operation ran against.
        host: String,
        /// Path the operation targeted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A destructive operation targeted a path outside the managed roots.
    #[error("refusing to touch {path}: not under managed root {root}")]
    UnsafePath {
        /// The rejected path.
        path: String,
        /// The root it was checked against.
        root: String,
    },

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// An HTTP transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be decoded into a typed record.
    #[error("decode error: {0}")]
    Decode(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReflinkError {
    /// Create a [`ReflinkError::Store`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn store<E: std::fmt::Display>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    /// Create a [`ReflinkError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`ReflinkError::Decode`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn decode<E: std::fmt::Display>(e: E) -> Self {
        Self::Decode(e.to_string())
    }

    /// Create a [`ReflinkError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// `true` when a create call lost against an existing object.
    ///
    /// Create conflicts are treated as success-equivalent by the
    /// reconciliation components.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
