/// The kind cluster resource: typed spec, validation and handle
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::descriptor::{PropertyValue, ResourceOptions, Urn};
use super::registry::{ResourceKind, ResourceSchema, TypeTag};
use crate::deployment::Deployment;
use crate::error::{self, ValidationError};
use crate::output::{Output, ResourceHandle};

/// Desired state of a kind cluster, using kind's v1alpha4 field names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Explicit cluster name; the runtime picks one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Cluster nodes, in display order
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_config: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubeadm_config_patches: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containerd_config_patches: Vec<String>,
}

/// Serialized names of the fields `NodeSpec` models itself
const MODELED_NODE_FIELDS: &[&str] = &[
    "role",
    "image",
    "labels",
    "extraMounts",
    "extraPortMappings",
    "kubeadmConfigPatches",
];

/// A single cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub role: NodeRole,

    /// Node image overriding the provider default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_port_mappings: Vec<PortMapping>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubeadm_config_patches: Vec<String>,

    /// Fields this client does not model, passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Host path mounted into a node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub selinux_relabel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<MountPropagation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPropagation {
    None,
    HostToContainer,
    Bidirectional,
}

/// Port forwarded from the host to a node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PortProtocol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

/// Cluster-wide networking settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<IpFamily>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,
    /// Pod CIDR (e.g., "10.244.0.0/16")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_subnet: Option<String>,
    /// Service CIDR (e.g., "10.96.0.0/12")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_subnet: Option<String>,
    #[serde(
        rename = "disableDefaultCNI",
        default,
        skip_serializing_if = "is_false"
    )]
    pub disable_default_cni: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_proxy_mode: Option<KubeProxyMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KubeProxyMode {
    Iptables,
    Ipvs,
    Nftables,
    None,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ClusterSpec {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_networking(mut self, networking: Networking) -> Self {
        self.networking = Some(networking);
        self
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            validate_cluster_name(name)?;
        }
        validate_nodes(&self.nodes)?;
        if let Some(networking) = &self.networking {
            networking.validate()?;
        }
        Ok(())
    }

    pub fn count(&self, role: NodeRole) -> usize {
        self.nodes.iter().filter(|n| n.role == role).count()
    }
}

impl NodeSpec {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            image: None,
            labels: BTreeMap::new(),
            extra_mounts: Vec::new(),
            extra_port_mappings: Vec::new(),
            kubeadm_config_patches: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn control_plane() -> Self {
        Self::new(NodeRole::ControlPlane)
    }

    pub fn worker() -> Self {
        Self::new(NodeRole::Worker)
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let field = |name: &str| format!("nodes[{}].{}", index, name);

        if let Some(key) = self.extra.keys().find(|k| MODELED_NODE_FIELDS.contains(&k.as_str())) {
            return Err(ValidationError::invalid(
                field("extra"),
                format!("{:?} is a modeled field and cannot be set as an extra field", key),
            ));
        }

        if let Some(image) = &self.image {
            if image.trim().is_empty() {
                return Err(ValidationError::invalid(field("image"), "cannot be empty"));
            }
        }

        if self.labels.keys().any(|k| k.is_empty()) {
            return Err(ValidationError::invalid(field("labels"), "label keys cannot be empty"));
        }

        for mount in &self.extra_mounts {
            if !mount.container_path.starts_with('/') {
                return Err(ValidationError::invalid(
                    field("extraMounts"),
                    format!("container path {:?} must be absolute", mount.container_path),
                ));
            }
            if mount.host_path.is_empty() {
                return Err(ValidationError::invalid(field("extraMounts"), "host path cannot be empty"));
            }
        }

        if self.extra_port_mappings.iter().any(|p| p.container_port == 0) {
            return Err(ValidationError::invalid(
                field("extraPortMappings"),
                "container port cannot be 0",
            ));
        }

        Ok(())
    }
}

impl Networking {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(cidr) = &self.pod_subnet {
            validate_cidr("networking.podSubnet", cidr)?;
        }
        if let Some(cidr) = &self.service_subnet {
            validate_cidr("networking.serviceSubnet", cidr)?;
        }
        Ok(())
    }
}

fn validate_nodes(nodes: &[NodeSpec]) -> Result<(), ValidationError> {
    if nodes.is_empty() {
        return Err(ValidationError::NoNodes);
    }
    for (index, node) in nodes.iter().enumerate() {
        node.validate(index)?;
    }
    Ok(())
}

/// Validate CIDR notation
fn validate_cidr(property: &str, cidr: &str) -> Result<(), ValidationError> {
    match cidr.split_once('/') {
        Some((addr, bits)) if !addr.is_empty() && bits.parse::<u8>().is_ok() => Ok(()),
        _ => Err(ValidationError::invalid(
            property,
            format!("invalid CIDR notation: {}", cidr),
        )),
    }
}

/// Cluster names must be lowercase DNS-1123 labels
fn validate_cluster_name(name: &str) -> Result<(), ValidationError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let alnum_edges = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    if name.len() <= 63 && valid_chars && alnum_edges {
        Ok(())
    } else {
        Err(ValidationError::invalid(
            "name",
            format!("{:?} is not a lowercase DNS-1123 label", name),
        ))
    }
}

/// Check the literal properties of a cluster descriptor
fn validate_cluster_properties(
    properties: &BTreeMap<String, PropertyValue>,
) -> Result<(), ValidationError> {
    match properties.get("nodes") {
        None => return Err(ValidationError::NoNodes),
        Some(PropertyValue::Deferred(_)) => {}
        Some(PropertyValue::Literal(value)) => {
            let nodes: Vec<NodeSpec> = serde_json::from_value(value.clone())
                .map_err(|e| ValidationError::invalid("nodes", e.to_string()))?;
            validate_nodes(&nodes)?;
        }
    }

    if let Some(PropertyValue::Literal(value)) = properties.get("name") {
        let name = value
            .as_str()
            .ok_or_else(|| ValidationError::invalid("name", "must be a string"))?;
        validate_cluster_name(name)?;
    }

    if let Some(PropertyValue::Literal(value)) = properties.get("networking") {
        let networking: Networking = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::invalid("networking", e.to_string()))?;
        networking.validate()?;
    }

    Ok(())
}

/// The `kind:cluster:Cluster` resource type
pub struct Cluster;

impl Cluster {
    pub const KUBECONFIG: &'static str = "kubeconfig";
    pub const NAME: &'static str = "name";

    pub fn type_tag() -> TypeTag {
        TypeTag::new("kind", "cluster", "Cluster")
    }

    /// Declare a cluster in `deployment`
    pub fn declare(
        deployment: &mut Deployment,
        name: &str,
        spec: ClusterSpec,
        options: ResourceOptions,
    ) -> error::Result<ClusterHandle> {
        deployment.declare::<Cluster>(name, &spec, options)
    }
}

impl ResourceKind for Cluster {
    type Args = ClusterSpec;
    type Handle = ClusterHandle;

    fn schema() -> ResourceSchema {
        ResourceSchema {
            type_tag: Self::type_tag(),
            outputs: vec![Self::KUBECONFIG.to_string(), Self::NAME.to_string()],
            validate: validate_cluster_properties,
        }
    }

    fn validate_args(spec: &ClusterSpec) -> Result<(), ValidationError> {
        spec.validate()
    }

    fn handle(resource: ResourceHandle) -> ClusterHandle {
        ClusterHandle {
            urn: resource.urn().clone(),
            outputs: ClusterOutputs {
                kubeconfig: resource.output(Self::KUBECONFIG),
                name: resource.output(Self::NAME),
            },
            resource,
        }
    }
}

/// Handle to a declared cluster
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub urn: Urn,
    pub outputs: ClusterOutputs,
    pub resource: ResourceHandle,
}

/// Deferred outputs of a cluster
#[derive(Debug, Clone)]
pub struct ClusterOutputs {
    /// Client configuration for the provisioned control plane
    pub kubeconfig: Output<String>,
    /// Resolved cluster name, possibly autonamed by the runtime
    pub name: Output<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn literal(properties: Value) -> BTreeMap<String, PropertyValue> {
        properties
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::Literal(v.clone())))
            .collect()
    }

    #[test]
    fn test_node_role_display() {
        assert_eq!(NodeRole::ControlPlane.to_string(), "control-plane");
        assert_eq!(NodeRole::Worker.to_string(), "worker");
    }

    #[test]
    fn test_spec_serializes_with_kind_field_names() {
        let spec = ClusterSpec::new(vec![NodeSpec::control_plane(), NodeSpec::worker()])
            .with_networking(Networking {
                disable_default_cni: true,
                pod_subnet: Some("10.244.0.0/16".to_string()),
                ..Networking::default()
            });

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            value,
            json!({
                "nodes": [{"role": "control-plane"}, {"role": "worker"}],
                "networking": {"podSubnet": "10.244.0.0/16", "disableDefaultCNI": true}
            })
        );
    }

    #[test]
    fn test_unknown_node_fields_are_kept() {
        let node: NodeSpec = serde_json::from_value(json!({
            "role": "worker",
            "labels": {"tier": "edge"},
            "extraFutureField": {"enabled": true}
        }))
        .unwrap();

        assert_eq!(node.role, NodeRole::Worker);
        assert_eq!(node.labels["tier"], "edge");
        assert_eq!(node.extra["extraFutureField"], json!({"enabled": true}));
        assert_eq!(serde_json::to_value(&node).unwrap()["extraFutureField"]["enabled"], true);
    }

    #[test]
    fn test_spec_validation() {
        let spec = ClusterSpec::new(vec![NodeSpec::control_plane()]);
        assert!(spec.validate().is_ok());

        assert_eq!(ClusterSpec::default().validate(), Err(ValidationError::NoNodes));

        let bad_name = spec.clone().with_name("Kind_Example");
        assert!(bad_name.validate().is_err());

        let mut bad_mount = NodeSpec::worker();
        bad_mount.extra_mounts.push(Mount {
            container_path: "data".to_string(),
            host_path: "/tmp/data".to_string(),
            read_only: false,
            selinux_relabel: false,
            propagation: None,
        });
        let err = ClusterSpec::new(vec![NodeSpec::control_plane(), bad_mount])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("nodes[1].extraMounts"));

        let bad_subnet = spec.with_networking(Networking {
            service_subnet: Some("10.96.0.0".to_string()),
            ..Networking::default()
        });
        assert!(bad_subnet.validate().is_err());
    }

    #[test]
    fn test_property_validation_rejects_unknown_role() {
        let err = validate_cluster_properties(&literal(json!({
            "nodes": [{"role": "load-balancer"}]
        })))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidProperty { ref property, .. } if property == "nodes"));

        assert_eq!(
            validate_cluster_properties(&literal(json!({"nodes": []}))),
            Err(ValidationError::NoNodes)
        );
        assert_eq!(
            validate_cluster_properties(&literal(json!({}))),
            Err(ValidationError::NoNodes)
        );
    }

    #[test]
    fn test_extra_fields_cannot_shadow_modeled_ones() {
        let shadowed = NodeSpec::control_plane().with_extra("role", json!("worker"));
        let err = ClusterSpec::new(vec![shadowed.clone()]).validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidProperty { ref property, .. } if property == "nodes[0].extra"
        ));

        let mut deployment = Deployment::new("dev");
        assert!(Cluster::declare(
            &mut deployment,
            "kind-example",
            ClusterSpec::new(vec![shadowed]),
            ResourceOptions::default(),
        )
        .is_err());
        assert!(deployment.is_empty());

        let ports = NodeSpec::worker().with_extra("extraPortMappings", json!([]));
        assert!(ClusterSpec::new(vec![ports]).validate().is_err());

        let future = NodeSpec::worker().with_extra("extraFutureField", json!(true));
        assert!(ClusterSpec::new(vec![future]).validate().is_ok());
    }

    #[test]
    fn test_cluster_name_rules() {
        assert!(validate_cluster_name("kind-example").is_ok());
        assert!(validate_cluster_name("-kind").is_err());
        assert!(validate_cluster_name("kind.example").is_err());
        assert!(validate_cluster_name("").is_err());
    }
}
