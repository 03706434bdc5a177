/// Provider runtime boundary and its implementations
pub mod http;
pub mod kind;
#[cfg(test)]
pub(crate) mod mock;
pub mod naming;
pub mod protocol;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::DispatchError;

pub use http::HttpRuntime;
pub use kind::KindRuntime;
pub use protocol::{ConfigureRequest, Operation, ProviderFault, ProviderRequest, ProviderResponse};

/// The external process that actually creates, reads, updates and deletes resources
#[async_trait]
pub trait ProviderRuntime: Send + Sync {
    /// Hand the provider its global configuration before any resource operation
    async fn configure(&self, variables: &BTreeMap<String, String>) -> Result<(), DispatchError> {
        let _ = variables;
        Ok(())
    }

    /// Perform one resource operation.
    ///
    /// `Err` means the runtime could not be reached or spoke nonsense; a
    /// runtime that understood the request and failed it answers with
    /// `ProviderResponse::Error`.
    async fn dispatch(&self, request: ProviderRequest) -> Result<ProviderResponse, DispatchError>;
}
