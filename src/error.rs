//! Error types for the v6lab reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph building, planning, provider calls, execution and
//! state management.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceKey;

/// The main error type for the v6lab engine.
#[derive(Debug, Error)]
pub enum V6labError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph building errors.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors outside of plan execution (lookups).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

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

    /// An environment override could not be interpreted.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Errors raised while turning declarations into a resource graph.
///
/// All of these are fatal before any provider call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Two declarations of the same kind share a logical name.
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName {
        /// Resource kind.
        kind: String,
        /// The duplicated name.
        name: String,
    },

    /// A reference names a node absent from the declaration set.
    #[error("{resource} property '{property}' references missing resource {target}")]
    DanglingReference {
        /// Declaring resource.
        resource: ResourceKey,
        /// Property holding the reference.
        property: String,
        /// The missing target.
        target: ResourceKey,
    },

    /// A reference names an attribute the target kind never outputs.
    #[error("{resource} property '{property}' references unknown attribute '{attribute}' of {target}")]
    UnknownAttribute {
        /// Declaring resource.
        resource: ResourceKey,
        /// Property holding the reference.
        property: String,
        /// Referenced resource.
        target: ResourceKey,
        /// The unknown attribute.
        attribute: String,
    },

    /// A property is not part of the kind's schema.
    #[error("{resource} has unknown property '{property}'")]
    UnknownProperty {
        /// Declaring resource.
        resource: ResourceKey,
        /// The unknown property.
        property: String,
    },

    /// A required property is missing.
    #[error("{resource} is missing required property '{property}'")]
    MissingProperty {
        /// Declaring resource.
        resource: ResourceKey,
        /// The missing property.
        property: String,
    },

    /// A logical name is empty or contains a path separator.
    #[error("Invalid {kind} name '{name}': names must be non-empty and must not contain '.'")]
    InvalidName {
        /// Resource kind.
        kind: String,
        /// The rejected name.
        name: String,
    },

    /// A lookup was referenced but never resolved.
    #[error("{resource} property '{property}' uses unresolved lookup '{lookup}'")]
    UnresolvedLookup {
        /// Declaring resource.
        resource: ResourceKey,
        /// Property holding the lookup.
        property: String,
        /// Lookup name.
        lookup: String,
    },

    /// A variable was referenced but has no value.
    #[error("{resource} property '{property}' uses variable '{variable}' which has no value")]
    UnresolvedVariable {
        /// Declaring resource.
        resource: ResourceKey,
        /// Property holding the variable.
        property: String,
        /// Variable name.
        variable: String,
    },
}

/// Planning errors. Fatal before execution, nothing mutated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// No valid order exists.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// One minimal cycle, in dependency order.
        cycle: Vec<String>,
    },

    /// An immutable-once-set property was changed.
    #[error("Property '{property}' of {resource} is immutable once set and cannot change")]
    ImmutablePropertyChanged {
        /// Resource whose property changed.
        resource: ResourceKey,
        /// The immutable property.
        property: String,
    },

    /// The approved plan no longer matches what the locked state yields.
    #[error("Plan is stale: {reason}; run plan again")]
    StalePlan {
        /// What changed since the plan was approved.
        reason: String,
    },
}

/// Errors returned by a provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider is throttling requests.
    #[error("Provider rate limited the request")]
    RateLimited {
        /// Suggested wait before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The provider is temporarily unavailable.
    #[error("Provider unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The provider did not answer in time.
    #[error("Provider timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected the request: {message}")]
    Rejected {
        /// Rejection reason.
        message: String,
    },

    /// The targeted object does not exist.
    #[error("Object not found: {id}")]
    NotFound {
        /// Provider-assigned id.
        id: String,
    },

    /// The provider answered with something unusable.
    #[error("Invalid provider response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A lookup matched no candidate.
    #[error("Lookup '{lookup}' matched no candidate")]
    LookupNoMatch {
        /// Lookup name.
        lookup: String,
    },
}

/// Why a single planned operation failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The provider reported a failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A property could not be resolved against dependency outputs.
    #[error("Cannot resolve property '{property}': {message}")]
    Resolution {
        /// Property being resolved.
        property: String,
        /// Description of the problem.
        message: String,
    },

    /// The worker running the operation died.
    #[error("Worker aborted: {message}")]
    WorkerAborted {
        /// Description of the abort.
        message: String,
    },
}

/// Aggregate error reported at the end of a partial run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} operation(s) failed, {} skipped", .failed.len(), .skipped.len())]
pub struct ExecutionError {
    /// Every failed node with its underlying error.
    pub failed: Vec<(ResourceKey, OperationError)>,
    /// Every skipped node with the failed ancestor that blocked it.
    pub skipped: Vec<(ResourceKey, ResourceKey)>,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

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

/// Result type alias for v6lab operations.
pub type Result<T> = std::result::Result<T, V6labError>;

fn format_cycle(cycle: &[String]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

impl V6labError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the error aborts a run before execution starts.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Build(_) | Self::Plan(_))
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
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
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

impl ProviderError {
    /// Returns true if the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Timeout { .. }
        )
    }

    /// Returns the provider's suggested retry delay, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates an invalid response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

impl OperationError {
    /// Creates a resolution error.
    #[must_use]
    pub fn resolution(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            property: property.into(),
            message: message.into(),
        }
    }
}

impl ExecutionError {
    /// Returns true if nothing failed or was skipped.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Timeout { message: String::from("slow") }.is_transient());
        assert!(!ProviderError::rejected("quota").is_transient());
        assert!(!ProviderError::NotFound { id: String::from("vpc-1") }.is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ProviderError::rejected("x").retry_after(), None);
    }

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = PlanError::CycleDetected {
            cycle: vec![String::from("vpc.a"), String::from("subnet.b")],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: vpc.a -> subnet.b -> vpc.a"
        );
    }

    #[test]
    fn test_abort_classification() {
        let build = V6labError::Build(BuildError::DuplicateName {
            kind: String::from("vpc"),
            name: String::from("main"),
        });
        assert!(build.is_abort());
        assert!(!V6labError::internal("boom").is_abort());
    }

    #[test]
    fn test_execution_error_summary() {
        let key = ResourceKey::new(ResourceKind::Subnet, "a");
        let err = ExecutionError {
            failed: vec![(key.clone(), ProviderError::rejected("no").into())],
            skipped: vec![(ResourceKey::new(ResourceKind::Instance, "i"), key)],
        };
        assert_eq!(err.to_string(), "1 operation(s) failed, 1 skipped");
        assert!(!err.is_empty());
    }
}
