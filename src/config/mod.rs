/// Configuration management for Kindling deployments
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::deployment::{Deployment, DeploymentState};
use crate::error::{self, ValidationError};
use crate::resource::{Cluster, ClusterHandle, ClusterSpec, Networking, NodeSpec, ResourceOptions, Urn};

/// Prefix of the provider variables sent with `configure`
pub const CONFIG_VARIABLE_PREFIX: &str = "kind:config:";

/// Environment variable kind itself reads to pick the container provider
pub const KIND_PROVIDER_ENV: &str = "KIND_EXPERIMENTAL_PROVIDER";

/// Environment variable holding the HTTP provider token
pub const PROVIDER_TOKEN_ENV: &str = "KINDLING_PROVIDER_TOKEN";

/// Main deployment manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentManifest {
    /// Deployment name (scopes resource urns and the state file)
    pub deployment: String,

    /// kind provider settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// How to reach the provider runtime
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Clusters to declare, in declaration order
    #[serde(default)]
    pub clusters: Vec<ClusterDeclaration>,
}

/// A cluster entry in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDeclaration {
    /// Logical resource name
    pub name: String,

    /// kind cluster spec
    pub spec: ClusterSpec,

    /// Names of clusters (declared earlier) that must be ready first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Container provider kind drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerProvider {
    #[default]
    Docker,
    Podman,
}

impl ContainerProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerProvider::Docker => "docker",
            ContainerProvider::Podman => "podman",
        }
    }
}

impl std::str::FromStr for ContainerProvider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ContainerProvider::Docker),
            "podman" => Ok(ContainerProvider::Podman),
            other => Err(ValidationError::invalid(
                "provider",
                format!("valid provider values are docker/podman, got {:?}", other),
            )),
        }
    }
}

/// kind provider globals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Container provider (default: docker, or KIND_EXPERIMENTAL_PROVIDER)
    #[serde(default = "default_container_provider")]
    pub provider: ContainerProvider,

    /// Node image used when a node does not set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image: Option<String>,

    /// File the runtime merges the generated kubeconfig into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_file: Option<PathBuf>,

    /// Keep nodes of a failed cluster for debugging (needs manual cleanup)
    #[serde(default)]
    pub retain_nodes_on_failure: bool,

    /// Seconds to wait for the control plane to become ready (0 = don't wait)
    #[serde(default)]
    pub wait_for_node_ready: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_container_provider(),
            node_image: None,
            kubeconfig_file: None,
            retain_nodes_on_failure: false,
            wait_for_node_ready: 0,
        }
    }
}

fn default_container_provider() -> ContainerProvider {
    std::env::var(KIND_PROVIDER_ENV)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default()
}

impl ProviderConfig {
    /// Encode as `kind:config:<key>` variables
    pub fn to_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(format!("{}{}", CONFIG_VARIABLE_PREFIX, key), value);
        };

        set("provider", self.provider.as_str().to_string());
        if let Some(image) = &self.node_image {
            set("nodeImage", image.clone());
        }
        if let Some(path) = &self.kubeconfig_file {
            set("kubeconfigFile", path.display().to_string());
        }
        set(
            "retainNodesOnFailure",
            self.retain_nodes_on_failure.to_string(),
        );
        set("waitForNodeReady", self.wait_for_node_ready.to_string());
        vars
    }

    /// Decode `kind:config:<key>` variables; unknown keys are ignored
    pub fn from_variables(vars: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let get = |key: &str| vars.get(&format!("{}{}", CONFIG_VARIABLE_PREFIX, key));
        let mut config = ProviderConfig::default();

        if let Some(provider) = get("provider") {
            config.provider = provider.parse()?;
        }
        config.node_image = get("nodeImage").filter(|s| !s.is_empty()).cloned();
        config.kubeconfig_file = get("kubeconfigFile")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(retain) = get("retainNodesOnFailure") {
            config.retain_nodes_on_failure = retain.parse().map_err(|_| {
                ValidationError::invalid("retainNodesOnFailure", format!("{:?} is not a boolean", retain))
            })?;
        }
        if let Some(wait) = get("waitForNodeReady") {
            config.wait_for_node_ready = wait.parse().map_err(|_| {
                ValidationError::invalid("waitForNodeReady", format!("{:?} is not a number of seconds", wait))
            })?;
        }

        Ok(config)
    }
}

/// Provider runtime selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// Drive the local `kind` CLI
    Kind {
        /// Path to the kind binary (default: `kind` from PATH)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<String>,
    },
    /// Talk to a provider service over HTTP
    Http {
        endpoint: String,
        /// Bearer token (can also be set via KINDLING_PROVIDER_TOKEN env var)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::Kind { binary: None }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

impl RuntimeConfig {
    /// Bearer token from config or environment
    pub fn token(&self) -> Option<String> {
        match self {
            RuntimeConfig::Http { token, .. } => token
                .clone()
                .or_else(|| std::env::var(PROVIDER_TOKEN_ENV).ok()),
            RuntimeConfig::Kind { .. } => None,
        }
    }
}

impl DeploymentManifest {
    /// Load a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: DeploymentManifest = serde_yaml::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.deployment.trim().is_empty() {
            anyhow::bail!("deployment cannot be empty");
        }

        if let RuntimeConfig::Http { endpoint, .. } = &self.runtime {
            if endpoint.trim().is_empty() {
                anyhow::bail!("runtime.endpoint cannot be empty");
            }
        }

        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            for dependency in &cluster.depends_on {
                if !seen.contains(dependency.as_str()) {
                    anyhow::bail!(
                        "cluster {} depends on {}, which is not declared before it",
                        cluster.name,
                        dependency
                    );
                }
            }
            seen.insert(cluster.name.as_str());
        }

        Ok(())
    }

    /// Build the deployment graph for this manifest.
    ///
    /// Handles are returned in manifest order.
    pub fn declare(
        &self,
        prior: Option<DeploymentState>,
    ) -> error::Result<(Deployment, Vec<ClusterHandle>)> {
        let mut deployment =
            Deployment::new(&self.deployment).with_provider_config(self.provider.clone());
        if let Some(state) = prior {
            deployment = deployment.with_prior_state(state)?;
        }

        let mut handles = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            let options = cluster
                .depends_on
                .iter()
                .fold(ResourceOptions::default(), |options, dependency| {
                    options.depends_on(Urn::new(&self.deployment, &Cluster::type_tag(), dependency))
                });
            handles.push(Cluster::declare(
                &mut deployment,
                &cluster.name,
                cluster.spec.clone(),
                options,
            )?);
        }

        Ok((deployment, handles))
    }

    /// Generate an example manifest
    pub fn example() -> Self {
        Self {
            deployment: "dev".to_string(),
            provider: ProviderConfig {
                provider: ContainerProvider::Docker,
                node_image: None,
                kubeconfig_file: None,
                retain_nodes_on_failure: false,
                wait_for_node_ready: 60,
            },
            runtime: RuntimeConfig::default(),
            clusters: vec![ClusterDeclaration {
                name: "kind-example".to_string(),
                spec: ClusterSpec::new(vec![NodeSpec::control_plane(), NodeSpec::worker()])
                    .with_networking(Networking {
                        disable_default_cni: false,
                        ..Networking::default()
                    }),
                depends_on: vec![],
            }],
        }
    }
}
