//! Error types for the forgeplan provisioning engine.
//!
//! Planning-phase errors (configuration, graph, plan) are fatal and are
//! raised before any state mutation. Execution-phase errors
//! ([`ProvisionError`]) are localized to a single execution node and are
//! reported in the run report instead of being raised.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ResourceAddress;

/// The main error type for forgeplan.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provisioning errors.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A variable was referenced but never defined.
    #[error("Undefined variable: {name}")]
    UndefinedVariable {
        /// Name of the variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// A resource address could not be parsed.
    #[error("Invalid resource address '{address}': {reason}")]
    InvalidAddress {
        /// The offending text.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("Invalid expression '{expression}': {reason}")]
    InvalidExpression {
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No provisioning client is registered for a resource type.
    #[error("No provisioner registered for resource type '{resource_type}' (used by {address})")]
    UnknownResourceType {
        /// The unregistered type.
        resource_type: String,
        /// First resource using it.
        address: String,
    },
}

/// A dependency cycle in a graph, listed as a closed path.
///
/// The first address is repeated at the end: `a -> b -> a`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", format_cycle(.cycle))]
pub struct CycleError {
    /// Members of the cycle in traversal order.
    pub cycle: Vec<String>,
}

fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph contains a cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// A dependency points at an address that is not in the configuration.
    #[error("{from} depends on {to}, which is not declared")]
    UnknownDependency {
        /// The dependent resource.
        from: ResourceAddress,
        /// The missing dependency.
        to: ResourceAddress,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A change would destroy a resource protected by `prevent_destroy`.
    #[error("Resource {address} has lifecycle.prevent_destroy set but the plan would destroy it")]
    DestroyBlocked {
        /// The protected resource.
        address: ResourceAddress,
    },

    /// A saved plan no longer matches the configuration and state.
    #[error("Saved plan is stale: computed against {expected}, current inputs hash to {found}")]
    StalePlan {
        /// Fingerprint recorded in the plan.
        expected: String,
        /// Fingerprint of the current inputs.
        found: String,
    },

    /// A saved plan file could not be read.
    #[error("Invalid plan file {path}: {message}")]
    InvalidPlanFile {
        /// Path of the plan file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// A recorded move cannot be applied to the current state.
    #[error("Cannot move {from} to {to}: {reason}")]
    InvalidMove {
        /// Source address.
        from: ResourceAddress,
        /// Destination address.
        to: ResourceAddress,
        /// Why the move is rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Optimistic concurrency check failed.
    #[error("State conflict on {address}: expected serial {expected}, found {found}")]
    Conflict {
        /// Address being written.
        address: ResourceAddress,
        /// Serial the writer expected.
        expected: u64,
        /// Serial actually stored.
        found: u64,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State was used before `open` was called.
    #[error("State store has not been opened")]
    NotOpen,

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Filesystem error in a state backend.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Errors raised by provisioning clients while executing a change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The remote API rejected the request.
    #[error("API error: {message}")]
    Api {
        /// Message returned by the API.
        message: String,
    },

    /// The request could not be delivered.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The object does not exist.
    #[error("object {real_id} not found")]
    NotFound {
        /// Provider-assigned identifier.
        real_id: String,
    },

    /// The attributes handed to the client are unusable.
    #[error("invalid attributes: {message}")]
    InvalidAttributes {
        /// Description of the problem.
        message: String,
    },

    /// The action exceeded its deadline.
    #[error("{address} timed out after {}s", .after.as_secs_f64())]
    Timeout {
        /// Resource whose action timed out.
        address: String,
        /// Deadline that was exceeded.
        after: Duration,
    },
}

/// Why a single execution node failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The provisioning client failed or timed out.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// A reference could not be resolved against live state.
    #[error("cannot resolve {attribute}: {reason}")]
    Unresolved {
        /// Attribute holding the reference.
        attribute: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Reading or writing the state store failed.
    #[error("state write failed: {0}")]
    State(String),

    /// The node could not run at all.
    #[error("{0}")]
    Internal(String),
}

/// Result type alias for forgeplan operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Result type alias for provisioning client calls.
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

impl ForgeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    ///
    /// A state conflict is resolved by re-planning against fresh state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Conflict { .. } | StateError::LockFailed { .. })
                | Self::Provision(ProvisionError::Transport { .. })
        )
    }

    /// Returns true if this error was raised before any mutation could happen.
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid expression error.
    #[must_use]
    pub fn expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProvisionError {
    /// Creates an API error.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an invalid attributes error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidAttributes {
            message: message.into(),
        }
    }

    /// Returns true for deadline failures.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl NodeError {
    /// Wraps a state store error.
    #[must_use]
    pub fn state(error: &ForgeError) -> Self {
        Self::State(error.to_string())
    }

    /// Returns true if the provisioning call exceeded its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Provision(e) if e.is_timeout())
    }
}
