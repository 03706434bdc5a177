/// Typed registry of resource types
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::cluster::Cluster;
use super::descriptor::PropertyValue;
use crate::error::ValidationError;
use crate::output::ResourceHandle;

/// Resource type tag of the form `package:module:Type`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeTag {
    package: String,
    module: String,
    name: String,
}

impl TypeTag {
    /// Build a tag from its parts; checked when the type is registered
    pub fn new(package: &str, module: &str, name: &str) -> Self {
        Self {
            package: package.to_string(),
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let lower = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        };
        let type_name = self
            .name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
            && self.name.chars().all(|c| c.is_ascii_alphanumeric());

        if lower(&self.package) && lower(&self.module) && type_name {
            Ok(())
        } else {
            Err(ValidationError::MalformedTypeTag(self.to_string()))
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.package, self.module, self.name)
    }
}

impl FromStr for TypeTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [package, module, name] = parts.as_slice() else {
            return Err(ValidationError::MalformedTypeTag(s.to_string()));
        };
        let tag = TypeTag::new(package, module, name);
        tag.validate()?;
        Ok(tag)
    }
}

impl TryFrom<String> for TypeTag {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.to_string()
    }
}

/// Checks a descriptor's literal properties; deferred ones are skipped
pub type Validator = fn(&BTreeMap<String, PropertyValue>) -> Result<(), ValidationError>;

/// What the client knows about a resource type
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub type_tag: TypeTag,
    /// Outputs every successful operation must return
    pub outputs: Vec<String>,
    pub validate: Validator,
}

/// A Rust type that can be declared in a deployment
pub trait ResourceKind {
    type Args: Serialize;
    type Handle;

    fn schema() -> ResourceSchema;

    /// Checks that need the typed value, before it is flattened into properties
    fn validate_args(args: &Self::Args) -> Result<(), ValidationError> {
        let _ = args;
        Ok(())
    }

    fn handle(resource: ResourceHandle) -> Self::Handle;
}

/// Type tag to schema mapping, checked at registration time
#[derive(Debug, Clone, Default)]
pub struct Registry {
    schemas: BTreeMap<TypeTag, ResourceSchema>,
}

impl Registry {
    /// Registry with the resource types this crate ships
    pub fn builtin() -> Self {
        let schema = Cluster::schema();
        let mut schemas = BTreeMap::new();
        schemas.insert(schema.type_tag.clone(), schema);
        Self { schemas }
    }

    /// Register a resource type
    pub fn register(&mut self, schema: ResourceSchema) -> Result<(), ValidationError> {
        schema.type_tag.validate()?;

        if let Some(output) = schema.outputs.iter().find(|o| o.is_empty()) {
            return Err(ValidationError::invalid(
                format!("{}.outputs", schema.type_tag),
                format!("output name {:?} is empty", output),
            ));
        }

        if self.schemas.contains_key(&schema.type_tag) {
            return Err(ValidationError::DuplicateType(schema.type_tag.to_string()));
        }

        self.schemas.insert(schema.type_tag.clone(), schema);
        Ok(())
    }

    /// Register the schema of a typed resource
    pub fn register_kind<K: ResourceKind>(&mut self) -> Result<(), ValidationError> {
        self.register(K::schema())
    }

    pub fn schema(&self, type_tag: &TypeTag) -> Option<&ResourceSchema> {
        self.schemas.get(type_tag)
    }

    pub fn contains(&self, type_tag: &TypeTag) -> bool {
        self.schemas.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &TypeTag> {
        self.schemas.keys()
    }
}
