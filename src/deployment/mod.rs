/// Deployment graph: declared resources, their dependencies and settlement channels
pub mod engine;
pub mod state;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{Result, ValidationError};
use crate::output::{OutputSettler, ResourceHandle};
use crate::resource::{Registry, ResourceDescriptor, ResourceKind, ResourceOptions, Urn};

pub use engine::{refresh, DeploymentSummary, LiveStatus, Phase, RefreshOutcome, ResourceOutcome};
pub use state::{DeploymentState, ResourceRecord};

/// Separates the parts of a urn, so it cannot appear in a logical name
const URN_SEPARATOR: &str = "::";

/// Cancels an in-flight `up`; every value still pending settles as cancelled
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A declared resource and what it waits for
#[derive(Debug)]
pub(crate) struct ResourceNode {
    pub(crate) urn: Urn,
    pub(crate) descriptor: ResourceDescriptor,
    /// Indices of earlier nodes this one reads outputs from or was told to wait for
    pub(crate) dependencies: Vec<usize>,
    pub(crate) settler: OutputSettler,
}

/// One deployment: the append-only set of resources declared for a single run
#[derive(Debug)]
pub struct Deployment {
    name: String,
    registry: Arc<Registry>,
    provider_config: ProviderConfig,
    nodes: Vec<ResourceNode>,
    names: HashSet<String>,
    by_urn: HashMap<Urn, usize>,
    prior: Option<DeploymentState>,
    cancel: CancelHandle,
}

impl Deployment {
    /// New deployment using the built-in resource types
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, Arc::new(Registry::builtin()))
    }

    pub fn with_registry(name: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            name: name.into(),
            registry,
            provider_config: ProviderConfig::default(),
            nodes: Vec::new(),
            names: HashSet::new(),
            by_urn: HashMap::new(),
            prior: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Provider globals sent with `configure`
    pub fn with_provider_config(mut self, config: ProviderConfig) -> Self {
        self.provider_config = config;
        self
    }

    /// Reconcile against what a previous run recorded
    pub fn with_prior_state(mut self, state: DeploymentState) -> Result<Self> {
        if state.deployment != self.name {
            return Err(ValidationError::invalid(
                "state",
                format!(
                    "recorded state belongs to deployment {:?}, not {:?}",
                    state.deployment, self.name
                ),
            )
            .into());
        }
        self.prior = Some(state);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn provider_config(&self) -> &ProviderConfig {
        &self.provider_config
    }

    /// Urns of the declared resources, in declaration order
    pub fn urns(&self) -> impl Iterator<Item = &Urn> {
        self.nodes.iter().map(|node| &node.urn)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Declare a typed resource
    pub fn declare<K: ResourceKind>(
        &mut self,
        name: &str,
        args: &K::Args,
        options: ResourceOptions,
    ) -> Result<K::Handle> {
        K::validate_args(args)?;
        let properties = match serde_json::to_value(args) {
            Ok(Value::Object(properties)) => properties,
            Ok(other) => {
                return Err(ValidationError::invalid(
                    "args",
                    format!("expected an object, got {}", other),
                )
                .into())
            }
            Err(e) => return Err(ValidationError::invalid("args", e.to_string()).into()),
        };

        let descriptor = ResourceDescriptor::from_properties(name, K::schema().type_tag, properties);
        let resource = self.declare_resource(descriptor, options)?;
        Ok(K::handle(resource))
    }

    /// Declare a resource of any registered type.
    ///
    /// Nothing is recorded unless every check passes.
    pub fn declare_resource(
        &mut self,
        descriptor: ResourceDescriptor,
        options: ResourceOptions,
    ) -> Result<ResourceHandle> {
        if descriptor.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if descriptor.name.contains(URN_SEPARATOR) {
            return Err(ValidationError::invalid(
                "name",
                format!("{:?} cannot contain {:?}", descriptor.name, URN_SEPARATOR),
            )
            .into());
        }
        if self.names.contains(&descriptor.name) {
            return Err(ValidationError::DuplicateName(descriptor.name.clone()).into());
        }

        let schema = self
            .registry
            .schema(&descriptor.type_tag)
            .ok_or_else(|| ValidationError::UnregisteredType(descriptor.type_tag.to_string()))?;
        (schema.validate)(&descriptor.properties)?;

        let urn = Urn::new(&self.name, &descriptor.type_tag, &descriptor.name);

        let mut dependencies = Vec::new();
        let targets = descriptor
            .references()
            .map(|reference| &reference.urn)
            .chain(options.depends_on.iter());
        for target in targets {
            let index = self
                .by_urn
                .get(target)
                .ok_or_else(|| ValidationError::UnknownDependency {
                    urn: urn.clone(),
                    target: target.clone(),
                })?;
            if !dependencies.contains(index) {
                dependencies.push(*index);
            }
        }

        let settler = OutputSettler::new();
        let handle = ResourceHandle::new(urn.clone(), settler.subscribe());
        debug!("Declared {} ({} dependencies)", urn, dependencies.len());

        self.names.insert(descriptor.name.clone());
        self.by_urn.insert(urn.clone(), self.nodes.len());
        self.nodes.push(ResourceNode {
            urn,
            descriptor,
            dependencies,
            settler,
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::output::OutputState;
    use crate::resource::{Cluster, ClusterSpec, NodeSpec, OutputRef, TypeTag};
    use serde_json::json;

    fn spec() -> ClusterSpec {
        ClusterSpec::new(vec![NodeSpec::control_plane()])
    }

    #[test]
    fn test_empty_node_list_is_rejected() {
        let mut deployment = Deployment::new("dev");
        let err = Cluster::declare(
            &mut deployment,
            "kind-example",
            ClusterSpec::default(),
            ResourceOptions::default(),
        )
        .unwrap_err();

        assert_eq!(err, Error::Validation(ValidationError::NoNodes));
        assert!(deployment.is_empty());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut deployment = Deployment::new("dev");
        Cluster::declare(&mut deployment, "kind-example", spec(), ResourceOptions::default()).unwrap();

        let err = Cluster::declare(&mut deployment, "kind-example", spec(), ResourceOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            Error::Validation(ValidationError::DuplicateName("kind-example".to_string()))
        );
        assert_eq!(deployment.len(), 1);
    }

    #[test]
    fn test_empty_name_and_unregistered_type() {
        let mut deployment = Deployment::new("dev");
        assert_eq!(
            Cluster::declare(&mut deployment, " ", spec(), ResourceOptions::default()).unwrap_err(),
            Error::Validation(ValidationError::EmptyName)
        );

        let descriptor = ResourceDescriptor::new("app", TypeTag::new("kind", "workload", "Manifest"));
        assert_eq!(
            deployment
                .declare_resource(descriptor, ResourceOptions::default())
                .unwrap_err(),
            Error::Validation(ValidationError::UnregisteredType(
                "kind:workload:Manifest".to_string()
            ))
        );
    }

    #[test]
    fn test_names_cannot_contain_urn_separator() {
        let mut deployment = Deployment::new("dev");
        let err = Cluster::declare(&mut deployment, "team::edge", spec(), ResourceOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::InvalidProperty { ref property, .. }) if property == "name"
        ));
        assert!(deployment.is_empty());

        let cluster =
            Cluster::declare(&mut deployment, "team-edge", spec(), ResourceOptions::default()).unwrap();
        assert_eq!(cluster.urn.name(), "team-edge");
    }

    #[test]
    fn test_dependencies_must_be_declared() {
        let mut deployment = Deployment::new("dev");
        let elsewhere = Urn::new("prod", &Cluster::type_tag(), "kind-example");

        let err = Cluster::declare(
            &mut deployment,
            "tenant",
            spec(),
            ResourceOptions::default().depends_on(elsewhere.clone()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UnknownDependency { ref target, .. }) if *target == elsewhere
        ));

        let descriptor = ResourceDescriptor::new("tenant", Cluster::type_tag())
            .with_literal("nodes", json!([{"role": "control-plane"}]))
            .with_deferred("name", OutputRef::new(elsewhere, "name"));
        assert!(deployment
            .declare_resource(descriptor, ResourceOptions::default())
            .is_err());
        assert!(deployment.is_empty());
    }

    #[test]
    fn test_declare_records_dependencies_once() {
        let mut deployment = Deployment::new("dev");
        let upstream =
            Cluster::declare(&mut deployment, "upstream", spec(), ResourceOptions::default()).unwrap();

        let descriptor = ResourceDescriptor::new("downstream", Cluster::type_tag())
            .with_literal("nodes", json!([{"role": "control-plane"}]))
            .with_deferred("name", upstream.outputs.name.reference().unwrap());
        let downstream = deployment
            .declare_resource(descriptor, ResourceOptions::default().depends_on(upstream.urn.clone()))
            .unwrap();

        assert_eq!(deployment.nodes[1].dependencies, vec![0]);
        assert_eq!(
            deployment.urns().collect::<Vec<_>>(),
            vec![&upstream.urn, downstream.urn()]
        );
        assert!(downstream.outputs().state().is_pending());
    }

    #[tokio::test]
    async fn test_dropped_deployment_cancels_outputs() {
        let mut deployment = Deployment::new("dev");
        let cluster =
            Cluster::declare(&mut deployment, "kind-example", spec(), ResourceOptions::default()).unwrap();
        drop(deployment);

        assert_eq!(cluster.outputs.kubeconfig.resolve().await, Err(Error::Cancelled));
        assert_eq!(cluster.outputs.name.state(), OutputState::Cancelled);
    }

    #[test]
    fn test_prior_state_must_match() {
        let state = DeploymentState::new("prod");
        assert!(Deployment::new("dev").with_prior_state(state).is_err());
        assert!(Deployment::new("dev")
            .with_prior_state(DeploymentState::new("dev"))
            .is_ok());
    }

    #[test]
    fn test_cancel_handle() {
        let deployment = Deployment::new("dev");
        let handle = deployment.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(deployment.cancel_handle().is_cancelled());
    }
}
