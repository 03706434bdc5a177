/// Provider runtime that drives the local `kind` CLI
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::naming;
use super::protocol::{Operation, ProviderFault, ProviderRequest, ProviderResponse};
use super::ProviderRuntime;
use crate::config::{ContainerProvider, ProviderConfig, KIND_PROVIDER_ENV};
use crate::error::DispatchError;
use crate::resource::{Cluster, ClusterSpec, PropertyMap};
use crate::utils::{check_tool_installed, CommandBuilder, CommandOutput};

pub const DEFAULT_KIND_BINARY: &str = "kind";

const KIND_INSTALL_URL: &str = "https://kind.sigs.k8s.io/docs/user/quick-start/#installation";

/// Cluster config document handed to `kind create cluster --config -`
#[derive(Serialize)]
struct KindClusterConfig<'a> {
    kind: &'static str,
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    #[serde(flatten)]
    spec: &'a ClusterSpec,
}

impl<'a> KindClusterConfig<'a> {
    fn new(spec: &'a ClusterSpec) -> Self {
        Self {
            kind: "Cluster",
            api_version: "kind.x-k8s.io/v1alpha4",
            spec,
        }
    }
}

/// kind CLI runtime
pub struct KindRuntime {
    binary: String,
    config: RwLock<ProviderConfig>,
}

impl KindRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            config: RwLock::new(ProviderConfig::default()),
        }
    }

    /// Check that the kind binary can be executed
    pub async fn check_installed(&self) -> anyhow::Result<()> {
        check_tool_installed(&self.binary, &["version"], KIND_INSTALL_URL).await
    }

    fn provider_config(&self) -> ProviderConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn kind(&self, config: &ProviderConfig) -> CommandBuilder {
        let mut command = CommandBuilder::new(&self.binary);
        if config.provider == ContainerProvider::Podman {
            command = command.env(KIND_PROVIDER_ENV, config.provider.as_str());
        }
        if let Some(path) = &config.kubeconfig_file {
            command = command.kubeconfig(path);
        }
        command
    }

    /// Run a kind command. `Err` only when the binary could not be run at all.
    async fn run(&self, command: CommandBuilder) -> Result<CommandOutput, DispatchError> {
        command
            .output()
            .await
            .map_err(|e| DispatchError::Unreachable(format!("{:#}", e)))
    }

    async fn create(
        &self,
        request: &ProviderRequest,
        inputs: PropertyMap,
        config: &ProviderConfig,
    ) -> Result<ProviderResponse, DispatchError> {
        let mut spec: ClusterSpec = match serde_json::from_value(Value::Object(inputs.clone())) {
            Ok(spec) => spec,
            Err(e) => {
                return Ok(ProviderResponse::fault(
                    ProviderFault::INVALID_INPUTS,
                    format!("inputs are not a kind cluster config: {}", e),
                ))
            }
        };
        let name = naming::assign_name(request.urn.name(), &inputs);
        spec.name = Some(name.clone());

        let document = serde_yaml::to_string(&KindClusterConfig::new(&spec)).map_err(|e| {
            DispatchError::Protocol(format!("failed to render kind config: {}", e))
        })?;
        debug!("kind config for {}:\n{}", name, document);

        let mut command = self
            .kind(config)
            .args(["create", "cluster", "--name", name.as_str(), "--config", "-"])
            .stdin(document)
            .context(format!("Failed to execute {} create cluster", self.binary));
        if let Some(image) = &config.node_image {
            command = command.args(["--image", image.as_str()]);
        }
        if config.retain_nodes_on_failure {
            command = command.arg("--retain");
        }
        if config.wait_for_node_ready > 0 {
            let wait = format!("{}s", config.wait_for_node_ready);
            command = command.args(["--wait", wait.as_str()]);
        }

        info!("Creating kind cluster {}...", name);
        let output = self.run(command).await?;
        if !output.success {
            if !config.retain_nodes_on_failure {
                let cleanup = self
                    .kind(config)
                    .args(["delete", "cluster", "--name", name.as_str()]);
                if let Err(e) = cleanup.run_silent().await {
                    warn!("Failed to clean up partially created cluster {}: {:#}", name, e);
                }
            }
            return Ok(ProviderResponse::fault(
                ProviderFault::OPERATION_FAILED,
                format!("kind create cluster {} failed: {}", name, output.stderr.trim()),
            ));
        }

        let kubeconfig = match self.kubeconfig(&name, config).await? {
            Ok(kubeconfig) => kubeconfig,
            Err(fault) => return Ok(ProviderResponse::Error(fault)),
        };
        info!("✓ kind cluster {} created", name);

        Ok(ProviderResponse::ok(
            Some(name.clone()),
            with_cluster_outputs(inputs, &name, kubeconfig),
        ))
    }

    async fn kubeconfig(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Result<String, ProviderFault>, DispatchError> {
        let output = self
            .run(self.kind(config).args(["get", "kubeconfig", "--name", name]))
            .await?;
        if output.success {
            Ok(Ok(output.stdout))
        } else {
            Ok(Err(ProviderFault::new(
                ProviderFault::OPERATION_FAILED,
                format!("kind get kubeconfig {} failed: {}", name, output.stderr.trim()),
            )))
        }
    }

    async fn read(
        &self,
        request: &ProviderRequest,
        config: &ProviderConfig,
    ) -> Result<ProviderResponse, DispatchError> {
        let Some(name) = request
            .id
            .clone()
            .or_else(|| naming::explicit_name(&request.inputs).map(str::to_string))
        else {
            return Ok(ProviderResponse::fault(
                ProviderFault::NOT_FOUND,
                format!("{} has no cluster name to look up", request.urn),
            ));
        };

        let output = self.run(self.kind(config).args(["get", "clusters"])).await?;
        if !output.success {
            return Ok(ProviderResponse::fault(
                ProviderFault::OPERATION_FAILED,
                format!("kind get clusters failed: {}", output.stderr.trim()),
            ));
        }
        if !output.stdout.lines().any(|line| line.trim() == name) {
            return Ok(ProviderResponse::fault(
                ProviderFault::NOT_FOUND,
                format!("kind cluster {} does not exist", name),
            ));
        }

        let kubeconfig = match self.kubeconfig(&name, config).await? {
            Ok(kubeconfig) => kubeconfig,
            Err(fault) => return Ok(ProviderResponse::Error(fault)),
        };
        Ok(ProviderResponse::ok(
            Some(name.clone()),
            with_cluster_outputs(request.inputs.clone(), &name, kubeconfig),
        ))
    }

    async fn delete(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Option<ProviderFault>, DispatchError> {
        info!("Deleting kind cluster {}...", name);
        let output = self
            .run(self.kind(config).args(["delete", "cluster", "--name", name]))
            .await?;
        if output.success {
            info!("✓ kind cluster {} deleted", name);
            Ok(None)
        } else {
            Ok(Some(ProviderFault::new(
                ProviderFault::OPERATION_FAILED,
                format!("kind delete cluster {} failed: {}", name, output.stderr.trim()),
            )))
        }
    }
}

impl Default for KindRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_KIND_BINARY)
    }
}

fn with_cluster_outputs(mut inputs: PropertyMap, name: &str, kubeconfig: String) -> PropertyMap {
    inputs.insert(Cluster::NAME.to_string(), Value::String(name.to_string()));
    inputs.insert(Cluster::KUBECONFIG.to_string(), Value::String(kubeconfig));
    inputs
}

#[async_trait]
impl ProviderRuntime for KindRuntime {
    async fn configure(&self, variables: &BTreeMap<String, String>) -> Result<(), DispatchError> {
        let config = ProviderConfig::from_variables(variables).map_err(|e| DispatchError::Rejected {
            status: 400,
            message: e.to_string(),
        })?;
        debug!("kind runtime configured: {:?}", config);
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }

    async fn dispatch(&self, request: ProviderRequest) -> Result<ProviderResponse, DispatchError> {
        if request.type_tag != Cluster::type_tag() {
            return Ok(ProviderResponse::fault(
                ProviderFault::UNKNOWN_TYPE,
                format!("kind runtime does not manage {}", request.type_tag),
            ));
        }

        let config = self.provider_config();
        match request.operation {
            Operation::Create => self.create(&request, request.inputs.clone(), &config).await,
            Operation::Read => self.read(&request, &config).await,
            Operation::Update => {
                // kind clusters cannot be changed in place: replace them.
                if let Some(id) = &request.id {
                    if let Some(fault) = self.delete(id, &config).await? {
                        return Ok(ProviderResponse::Error(fault));
                    }
                }
                let mut inputs = request.inputs.clone();
                naming::adopt_old_name(&mut inputs, request.id.as_deref());
                self.create(&request, inputs, &config).await
            }
            Operation::Delete => {
                let name = request.id.clone().or_else(|| {
                    request
                        .olds
                        .as_ref()
                        .and_then(naming::explicit_name)
                        .map(str::to_string)
                });
                let Some(name) = name else {
                    warn!("{} has no recorded cluster name, nothing to delete", request.urn);
                    return Ok(ProviderResponse::ok(None, PropertyMap::new()));
                };
                match self.delete(&name, &config).await? {
                    None => Ok(ProviderResponse::ok(Some(name), PropertyMap::new())),
                    Some(fault) => Ok(ProviderResponse::Error(fault)),
                }
            }
        }
    }
}
