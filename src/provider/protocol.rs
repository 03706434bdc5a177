/// Wire format of requests and responses exchanged with a provider runtime
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::resource::{PropertyMap, TypeTag, Urn};

/// Resource operation requested from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A single resource operation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub operation: Operation,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub urn: Urn,
    pub name: String,
    /// Provider id from a previous create; absent on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Fully resolved inputs, no deferred values remain
    #[serde(default)]
    pub inputs: PropertyMap,
    /// Inputs recorded by the previous run, sent with update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub olds: Option<PropertyMap>,
}

impl ProviderRequest {
    fn new(operation: Operation, type_tag: TypeTag, urn: Urn) -> Self {
        Self {
            operation,
            name: urn.name().to_string(),
            type_tag,
            urn,
            id: None,
            inputs: PropertyMap::new(),
            olds: None,
        }
    }

    pub fn create(type_tag: TypeTag, urn: Urn, inputs: PropertyMap) -> Self {
        Self {
            inputs,
            ..Self::new(Operation::Create, type_tag, urn)
        }
    }

    pub fn read(type_tag: TypeTag, urn: Urn, id: Option<String>, inputs: PropertyMap) -> Self {
        Self {
            id,
            inputs,
            ..Self::new(Operation::Read, type_tag, urn)
        }
    }

    pub fn update(
        type_tag: TypeTag,
        urn: Urn,
        id: Option<String>,
        olds: PropertyMap,
        inputs: PropertyMap,
    ) -> Self {
        Self {
            id,
            inputs,
            olds: Some(olds),
            ..Self::new(Operation::Update, type_tag, urn)
        }
    }

    pub fn delete(type_tag: TypeTag, urn: Urn, id: Option<String>, olds: PropertyMap) -> Self {
        Self {
            id,
            olds: Some(olds),
            ..Self::new(Operation::Delete, type_tag, urn)
        }
    }
}

/// Fault reported by the runtime for a specific operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFault {
    pub kind: String,
    pub message: String,
}

impl ProviderFault {
    pub const NOT_FOUND: &'static str = "NotFound";
    pub const UNKNOWN_TYPE: &'static str = "UnknownType";
    pub const INVALID_INPUTS: &'static str = "InvalidInputs";
    pub const OPERATION_FAILED: &'static str = "OperationFailed";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == Self::NOT_FOUND
    }
}

/// Outcome of one operation as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProviderResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        outputs: PropertyMap,
    },
    Error(ProviderFault),
}

impl ProviderResponse {
    pub fn ok(id: Option<String>, outputs: PropertyMap) -> Self {
        ProviderResponse::Ok { id, outputs }
    }

    pub fn fault(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderResponse::Error(ProviderFault::new(kind, message))
    }
}

/// Payload of the `configure` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub variables: BTreeMap<String, String>,
}
