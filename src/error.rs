/// Error taxonomy for declaring, submitting and resolving resources
use thiserror::Error;

use crate::resource::Urn;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error. Cloneable so a settled failure can be observed by every
/// consumer of a deferred value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("runtime dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("deployment was cancelled")]
    Cancelled,
}

/// Locally detectable problems, raised before the runtime is contacted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("resource name cannot be empty")]
    EmptyName,

    #[error("resource name {0:?} is already declared in this deployment")]
    DuplicateName(String),

    #[error("a cluster must declare at least one node")]
    NoNodes,

    #[error("invalid property {property}: {reason}")]
    InvalidProperty { property: String, reason: String },

    #[error("resource type {0} is not registered")]
    UnregisteredType(String),

    #[error("resource type {0} is already registered")]
    DuplicateType(String),

    #[error("malformed type tag {0:?}, expected package:module:Type")]
    MalformedTypeTag(String),

    #[error("{urn} references {target}, which is not declared in this deployment")]
    UnknownDependency { urn: Urn, target: Urn },
}

impl ValidationError {
    pub(crate) fn invalid(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProperty {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

/// Transport or runtime-level failure while talking to the provider runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("provider runtime unreachable: {0}")]
    Unreachable(String),

    #[error("provider runtime rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    Protocol(String),

    #[error("invalid provider endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("timeout after {secs} seconds: {operation}")]
    Timeout { operation: String, secs: u64 },
}

/// The runtime (or a dependency) failed a specific resource operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("provider failed {operation} of {urn}: {kind}: {message}")]
    Provider {
        urn: Urn,
        operation: String,
        kind: String,
        message: String,
    },

    #[error("{urn} was not submitted because dependency {dependency} failed")]
    DependencyFailed { urn: Urn, dependency: Urn },

    #[error("{urn} has no output named {key:?}")]
    MissingOutput { urn: Urn, key: String },

    #[error("output {key:?} of {urn} is malformed: {reason}")]
    MalformedOutput { urn: Urn, key: String, reason: String },
}
