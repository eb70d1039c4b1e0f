//! Resource objects, codecs and revision versioning.
//!
//! Objects are stored as encoded bytes; the resource version is never part of
//! the stored payload and is stamped from the backend revision on decode.

use crate::core::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object metadata exposed to predicates and preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace.
    #[serde(default)]
    pub name: String,

    /// Namespace for namespaced resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Stable identity, assigned once on create.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Caller labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Decimal backend revision of the last modification.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

/// A declarative resource: metadata plus an opaque JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Opaque payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,
}

impl Resource {
    /// Create a cluster-scoped resource.
    pub fn new(name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
            spec,
        }
    }

    /// Create a namespaced resource.
    pub fn namespaced(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        let mut obj = Self::new(name, spec);
        obj.metadata.namespace = Some(namespace.into());
        obj
    }

    /// Builder-style label setter.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Builder-style UID setter.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.metadata.uid = uid.into();
        self
    }

    /// Object UID (empty if unassigned).
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Whether this is the zero-value object.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A list of resources with the snapshot revision it was read at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// Listed items.
    pub items: Vec<Resource>,

    /// Decimal snapshot revision.
    #[serde(default)]
    pub resource_version: String,
}

/// Encode/decode path between objects and stored bytes.
///
/// Transforms such as encryption or compression live behind this trait; the
/// stores never reimplement them.
pub trait Codec: Send + Sync {
    /// Encode an object for storage.
    fn encode(&self, obj: &Resource) -> StorageResult<Vec<u8>>;

    /// Decode stored bytes read from `key`.
    fn decode(&self, key: &str, data: &[u8]) -> StorageResult<Resource>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, obj: &Resource) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(obj).map_err(|e| StorageError::codec(&obj.metadata.name, e.to_string()))
    }

    fn decode(&self, key: &str, data: &[u8]) -> StorageResult<Resource> {
        serde_json::from_slice(data).map_err(|e| StorageError::codec(key, e.to_string()))
    }
}

/// Converts between backend revisions and resource versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Versioner;

impl Versioner {
    /// Parse a resource version. The empty string means "unset" (0).
    pub fn parse_resource_version(&self, resource_version: &str) -> StorageResult<u64> {
        if resource_version.is_empty() {
            return Ok(0);
        }
        resource_version.parse::<u64>().map_err(|_| {
            StorageError::invalid(format!("invalid resource version {:?}", resource_version))
        })
    }

    /// Revision recorded on an object.
    pub fn object_revision(&self, obj: &Resource) -> StorageResult<u64> {
        self.parse_resource_version(&obj.metadata.resource_version)
    }

    /// Stamp an object with a revision.
    pub fn update_object(&self, obj: &mut Resource, revision: u64) {
        obj.metadata.resource_version = if revision == 0 {
            String::new()
        } else {
            revision.to_string()
        };
    }

    /// Stamp a list with its snapshot revision.
    pub fn update_list(&self, list: &mut ResourceList, revision: u64) {
        list.resource_version = revision.to_string();
    }

    /// Clear fields that must not be persisted.
    pub fn prepare_for_storage(&self, obj: &mut Resource) {
        obj.metadata.resource_version.clear();
    }
}
