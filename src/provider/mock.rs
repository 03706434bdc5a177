/// In-memory provider runtime with scripted replies and per-resource gates
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::protocol::{Operation, ProviderFault, ProviderRequest, ProviderResponse};
use super::ProviderRuntime;
use crate::error::DispatchError;
use crate::resource::PropertyMap;

/// Scripted answer for requests about one resource
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(PropertyMap),
    Fault(ProviderFault),
    Unreachable,
}

#[derive(Default)]
pub(crate) struct MockRuntime {
    requests: Mutex<Vec<ProviderRequest>>,
    replies: Mutex<HashMap<String, Reply>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    configured: Mutex<Option<BTreeMap<String, String>>>,
    configure_error: Option<DispatchError>,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_configure(error: DispatchError) -> Self {
        Self {
            configure_error: Some(error),
            ..Self::default()
        }
    }

    /// Answer every request about `name` with `reply`
    pub(crate) fn reply(&self, name: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(name.to_string(), reply);
    }

    /// Hold requests about `name` until the returned sender fires or is dropped
    pub(crate) fn gate(&self, name: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(name.to_string(), rx);
        tx
    }

    pub(crate) fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_for(&self, name: &str) -> Vec<ProviderRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }

    pub(crate) fn configured(&self) -> Option<BTreeMap<String, String>> {
        self.configured.lock().unwrap().clone()
    }

    /// Outputs a real kind runtime would return
    fn default_outputs(request: &ProviderRequest) -> PropertyMap {
        let mut outputs = request.inputs.clone();
        let name = request.id.clone().unwrap_or_else(|| request.name.clone());
        outputs.insert("kubeconfig".to_string(), json!(format!("kubeconfig for {}", name)));
        outputs.insert("name".to_string(), json!(name));
        outputs
    }
}

#[async_trait]
impl ProviderRuntime for MockRuntime {
    async fn configure(&self, variables: &BTreeMap<String, String>) -> Result<(), DispatchError> {
        if let Some(err) = &self.configure_error {
            return Err(err.clone());
        }
        *self.configured.lock().unwrap() = Some(variables.clone());
        Ok(())
    }

    async fn dispatch(&self, request: ProviderRequest) -> Result<ProviderResponse, DispatchError> {
        self.requests.lock().unwrap().push(request.clone());

        let gate = self.gates.lock().unwrap().remove(&request.name);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let reply = self.replies.lock().unwrap().get(&request.name).cloned();
        let id = Some(request.id.clone().unwrap_or_else(|| request.name.clone()));
        match (request.operation, reply) {
            (_, Some(Reply::Unreachable)) => Err(DispatchError::Unreachable(format!(
                "no route to provider for {}",
                request.name
            ))),
            (_, Some(Reply::Fault(fault))) => Ok(ProviderResponse::Error(fault)),
            (Operation::Delete, _) => Ok(ProviderResponse::ok(None, PropertyMap::new())),
            (_, Some(Reply::Ok(outputs))) => Ok(ProviderResponse::ok(id, outputs)),
            (_, None) => Ok(ProviderResponse::ok(id, Self::default_outputs(&request))),
        }
    }
}
