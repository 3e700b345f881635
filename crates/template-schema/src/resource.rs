//! Captured resource envelope.

use aioclone_common::{Error, ResourceId, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Property keys dropped from every captured resource.
pub const PRUNED_PROPERTIES: &[&str] = &["provisioningState", "status", "statuses", "currentVersion"];

/// Expression every emitted `extendedLocation.name` points at.
pub const CUSTOM_LOCATION_REF: &str =
    "[resourceId('Microsoft.ExtendedLocation/customLocations', parameters('customLocationName'))]";

/// Where a resource lives on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedLocation {
    pub name: String,
    #[serde(rename = "type", default = "ExtendedLocation::default_type")]
    pub location_type: String,
}

impl ExtendedLocation {
    fn default_type() -> String {
        "CustomLocation".to_string()
    }

    /// The rewritten extended location used in emitted templates.
    pub fn target() -> Self {
        Self {
            name: CUSTOM_LOCATION_REF.to_string(),
            location_type: Self::default_type(),
        }
    }
}

/// A resource read from the source and pruned of server-owned fields.
///
/// `properties` is kept as an opaque JSON subtree so provider schema churn does
/// not leak into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResource {
    /// Source id; used for walking the tree, never emitted.
    #[serde(skip)]
    pub source_id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub api_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_location: Option<ExtendedLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(default = "empty_object")]
    pub properties: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Wire shape of a resource as returned by ARM or Resource Graph.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    id: String,
    name: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    extended_location: Option<ExtendedLocation>,
    #[serde(default)]
    identity: Option<Value>,
    #[serde(default)]
    tags: Option<Value>,
    #[serde(default)]
    properties: Option<Value>,
}

impl CapturedResource {
    /// Capture a raw ARM record, pruning `id`, `systemData`, read-only state
    /// properties and identity principal ids.
    pub fn capture(value: Value, api_version: &str) -> Result<Self> {
        let raw: RawResource = serde_json::from_value(value)?;

        let mut properties = raw.properties.unwrap_or_else(empty_object);
        if let Some(props) = properties.as_object_mut() {
            for key in PRUNED_PROPERTIES {
                props.remove(*key);
            }
        }

        let mut identity = raw.identity;
        if let Some(Value::Object(ident)) = identity.as_mut() {
            ident.remove("principalId");
            if ident.is_empty() {
                identity = None;
            }
        }

        Ok(Self {
            source_id: raw.id,
            resource_type: raw.resource_type,
            api_version: api_version.to_string(),
            name: raw.name,
            location: raw.location,
            extended_location: raw.extended_location,
            identity,
            tags: raw.tags.filter(|t| t.as_object().map(|o| !o.is_empty()).unwrap_or(false)),
            properties,
        })
    }

    /// A resource generated by the engine rather than read from the source.
    pub fn synthetic(resource_type: &str, api_version: &str, name: &str, properties: Value) -> Self {
        Self {
            source_id: String::new(),
            resource_type: resource_type.to_string(),
            api_version: api_version.to_string(),
            name: name.to_string(),
            location: None,
            extended_location: None,
            identity: None,
            tags: None,
            properties,
        }
    }

    /// Parsed source id.
    pub fn resource_id(&self) -> Result<ResourceId> {
        self.source_id.parse()
    }

    /// Replace the resource type casing, e.g. Resource Graph's lower-cased
    /// `microsoft.deviceregistry/assets` with the provider form.
    pub fn with_type(mut self, resource_type: &str) -> Self {
        self.resource_type = resource_type.to_string();
        self
    }

    /// Look up a string property by JSON pointer under `properties`.
    pub fn property_str(&self, pointer: &str) -> Option<&str> {
        self.properties.pointer(pointer).and_then(Value::as_str)
    }

    /// Whether this resource is bound to the given custom location.
    pub fn is_on_custom_location(&self, custom_location_id: &str) -> bool {
        self.extended_location
            .as_ref()
            .map(|loc| aioclone_common::ids_match(&loc.name, custom_location_id))
            .unwrap_or(false)
    }

    /// Point `extendedLocation` at the target custom location parameter.
    pub fn retarget_extended_location(&mut self) {
        if self.extended_location.is_some() {
            self.extended_location = Some(ExtendedLocation::target());
        }
    }

    /// Serialize to the emitted JSON form.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Error::from)
    }
}
