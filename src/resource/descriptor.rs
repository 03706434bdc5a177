/// Resource descriptors and their (possibly deferred) property values
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::registry::TypeTag;
use crate::error::ResolutionError;

/// Property bag exchanged with the provider runtime
pub type PropertyMap = serde_json::Map<String, Value>;

/// Stable identifier of a declared resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Build the urn of `name` of type `type_tag` within `deployment`
    pub fn new(deployment: &str, type_tag: &TypeTag, name: &str) -> Self {
        Self(format!("urn:kindling:{}::{}::{}", deployment, type_tag, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Logical name the resource was declared with
    pub fn name(&self) -> &str {
        self.0.rsplit("::").next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a named output of another resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub urn: Urn,
    pub key: String,
}

impl OutputRef {
    pub fn new(urn: Urn, key: impl Into<String>) -> Self {
        Self {
            urn,
            key: key.into(),
        }
    }
}

/// A resource input: either known at declaration time or another resource's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Literal(Value),
    Deferred(OutputRef),
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Literal(value)
    }
}

impl From<OutputRef> for PropertyValue {
    fn from(reference: OutputRef) -> Self {
        PropertyValue::Deferred(reference)
    }
}

/// Client-side declaration of a resource managed by the provider runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            type_tag,
            properties: BTreeMap::new(),
        }
    }

    /// Descriptor whose properties are all known up front
    pub fn from_properties(name: impl Into<String>, type_tag: TypeTag, properties: PropertyMap) -> Self {
        Self {
            name: name.into(),
            type_tag,
            properties: properties
                .into_iter()
                .map(|(key, value)| (key, PropertyValue::Literal(value)))
                .collect(),
        }
    }

    pub fn with_literal(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), PropertyValue::Literal(value));
        self
    }

    pub fn with_deferred(mut self, key: impl Into<String>, reference: OutputRef) -> Self {
        self.properties
            .insert(key.into(), PropertyValue::Deferred(reference));
        self
    }

    /// Outputs of other resources this descriptor reads
    pub fn references(&self) -> impl Iterator<Item = &OutputRef> {
        self.properties.values().filter_map(|value| match value {
            PropertyValue::Deferred(reference) => Some(reference),
            PropertyValue::Literal(_) => None,
        })
    }

    /// Substitute every deferred property with the settled output it refers to
    pub(crate) fn resolve_inputs(
        &self,
        settled: &HashMap<Urn, PropertyMap>,
    ) -> Result<PropertyMap, ResolutionError> {
        let mut inputs = PropertyMap::new();
        for (key, value) in &self.properties {
            let value = match value {
                PropertyValue::Literal(value) => value.clone(),
                PropertyValue::Deferred(reference) => settled
                    .get(&reference.urn)
                    .and_then(|outputs| outputs.get(&reference.key))
                    .cloned()
                    .ok_or_else(|| ResolutionError::MissingOutput {
                        urn: reference.urn.clone(),
                        key: reference.key.clone(),
                    })?,
            };
            inputs.insert(key.clone(), value);
        }
        Ok(inputs)
    }
}

/// Per-declaration options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceOptions {
    /// Explicit ordering edges on top of the ones implied by deferred inputs
    pub depends_on: Vec<Urn>,
}

impl ResourceOptions {
    pub fn depends_on(mut self, urn: Urn) -> Self {
        self.depends_on.push(urn);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag() -> TypeTag {
        TypeTag::new("kind", "cluster", "Cluster")
    }

    #[test]
    fn test_urn_format() {
        let urn = Urn::new("dev", &tag(), "kind-example");
        assert_eq!(urn.as_str(), "urn:kindling:dev::kind:cluster:Cluster::kind-example");
        assert_eq!(urn.name(), "kind-example");
    }

    #[test]
    fn test_resolve_inputs_substitutes_deferred_values() {
        let upstream = Urn::new("dev", &tag(), "upstream");
        let descriptor = ResourceDescriptor::new("downstream", tag())
            .with_literal("replicas", json!(2))
            .with_deferred("kubeconfig", OutputRef::new(upstream.clone(), "kubeconfig"));

        let mut outputs = PropertyMap::new();
        outputs.insert("kubeconfig".to_string(), json!("apiVersion: v1"));
        let settled = HashMap::from([(upstream, outputs)]);

        let inputs = descriptor.resolve_inputs(&settled).unwrap();
        assert_eq!(inputs["replicas"], json!(2));
        assert_eq!(inputs["kubeconfig"], json!("apiVersion: v1"));
    }

    #[test]
    fn test_resolve_inputs_missing_output() {
        let upstream = Urn::new("dev", &tag(), "upstream");
        let descriptor = ResourceDescriptor::new("downstream", tag())
            .with_deferred("endpoint", OutputRef::new(upstream.clone(), "endpoint"));
        let settled = HashMap::from([(upstream.clone(), PropertyMap::new())]);

        let err = descriptor.resolve_inputs(&settled).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingOutput {
                urn: upstream,
                key: "endpoint".to_string()
            }
        );
    }

    #[test]
    fn test_property_value_wire_shape() {
        let value = PropertyValue::Literal(json!("worker"));
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({"literal": "worker"}));
    }
}
