/// Kindling - typed kind cluster declarations
///
/// Declare kind clusters as typed resources, submit them to a provider
/// runtime and consume their `name` and `kubeconfig` as deferred outputs.
pub mod config;
pub mod deployment;
pub mod error;
pub mod output;
pub mod provider;
pub mod resource;
pub mod utils;

pub use deployment::{CancelHandle, Deployment, DeploymentState, DeploymentSummary, Phase};
pub use error::{DispatchError, Error, ResolutionError, Result, ValidationError};
pub use output::{Output, OutputState, ResourceHandle};
pub use provider::{HttpRuntime, KindRuntime, ProviderRuntime};
pub use resource::{Cluster, ClusterHandle, ClusterSpec, NodeRole, NodeSpec, ResourceOptions};
