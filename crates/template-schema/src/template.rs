//! ARM deployment template document.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// `$schema` of every emitted template.
pub const DEPLOYMENT_TEMPLATE_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";

/// Template language with map-shaped (symbolic) resources.
pub const LANGUAGE_VERSION: &str = "2.0";

pub const CONTENT_VERSION: &str = "1.0.0.0";

/// Parameters every nested deployment receives from the root template.
pub const SHARED_PARAMETERS: &[&str] = &[
    "clusterName",
    "customLocationName",
    "resourceSlug",
    "instanceName",
];

/// Type of a template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Bool,
    Int,
    Object,
}

/// A template parameter declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ParameterDef {
    /// A parameter without a default.
    pub fn required(param_type: ParameterType) -> Self {
        Self {
            param_type,
            default_value: None,
        }
    }

    /// A parameter with a default value or expression.
    pub fn with_default(param_type: ParameterType, default_value: Value) -> Self {
        Self {
            param_type,
            default_value: Some(default_value),
        }
    }
}

/// Provenance recorded in the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    pub ops_cli_version: String,
    pub cloned_instance_id: String,
}

/// An ARM deployment template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub language_version: String,
    pub content_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterDef>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub resources: IndexMap<String, Value>,
}

impl Template {
    /// An empty template with the given parameter declarations.
    pub fn new(parameters: IndexMap<String, ParameterDef>) -> Self {
        Self {
            schema: DEPLOYMENT_TEMPLATE_SCHEMA.to_string(),
            language_version: LANGUAGE_VERSION.to_string(),
            content_version: CONTENT_VERSION.to_string(),
            metadata: None,
            parameters,
            variables: IndexMap::new(),
            resources: IndexMap::new(),
        }
    }

    /// Pretty JSON with two-space indentation.
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Symbolic keys of nested deployments in this template.
    pub fn deployment_keys(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, r)| {
                r.get("type")
                    .and_then(Value::as_str)
                    .map(|t| t.eq_ignore_ascii_case(DEPLOYMENTS_TYPE))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

pub const DEPLOYMENTS_TYPE: &str = "Microsoft.Resources/deployments";

/// Declarations of [`SHARED_PARAMETERS`] for an inner template.
pub fn shared_parameter_defs() -> IndexMap<String, ParameterDef> {
    SHARED_PARAMETERS
        .iter()
        .map(|name| (name.to_string(), ParameterDef::required(ParameterType::String)))
        .collect()
}

/// Values forwarding [`SHARED_PARAMETERS`] from the enclosing template.
pub fn shared_parameter_values() -> IndexMap<String, Value> {
    SHARED_PARAMETERS
        .iter()
        .map(|name| (name.to_string(), json!(format!("[parameters('{}')]", name))))
        .collect()
}

/// `{name: {"value": v}}` form used by deployment bodies.
pub fn wrap_parameter_values<'a, I>(values: I) -> Value
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let map: serde_json::Map<String, Value> = values
        .into_iter()
        .map(|(k, v)| (k.clone(), json!({ "value": v })))
        .collect();
    Value::Object(map)
}
