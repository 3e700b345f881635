//! Template validation: schema shape plus clone invariants.

use crate::resource::{CUSTOM_LOCATION_REF, PRUNED_PROPERTIES};
use crate::schema;
use crate::template::Template;
use jsonschema::JSONSchema;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Validation error type.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Schema validation failed: {0}")]
    SchemaError(String),

    #[error("Resource '{resource}' carries server-owned field '{field}'")]
    ServerOwnedField { resource: String, field: String },

    #[error("Resource '{resource}' has extendedLocation '{found}' instead of the target custom location")]
    ForeignExtendedLocation { resource: String, found: String },

    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnresolvedDependency {
        resource: String,
        dependency: String,
    },

    #[error("Dependency cycle detected at resource '{0}'")]
    DependencyCycle(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result of template validation.
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a template document.
pub fn validate_template(template: &Template) -> Result<ValidationResult, ValidationError> {
    let value = serde_json::to_value(template)?;
    validate_template_value(&value)
}

/// Validate a root template given as raw JSON.
pub fn validate_template_value(template: &Value) -> Result<ValidationResult, ValidationError> {
    let mut result = ValidationResult::new();

    let schema_value = schema::template_schema();
    let compiled = JSONSchema::compile(&schema_value)
        .map_err(|e| ValidationError::SchemaError(e.to_string()))?;

    if let Err(errors) = compiled.validate(template) {
        for error in errors {
            result.add_error(ValidationError::SchemaError(format!(
                "{} at {}",
                error, error.instance_path
            )));
        }
    }

    if let Some(resources) = template.get("resources").and_then(Value::as_object) {
        check_resources("", resources, &mut result);
        check_cycles(resources, &mut result);
    }

    Ok(result)
}

/// Walk a resource map, descending into inline nested templates.
fn check_resources(prefix: &str, resources: &Map<String, Value>, result: &mut ValidationResult) {
    for (key, resource) in resources {
        let path = format!("{}{}", prefix, key);

        for field in ["id", "systemData"] {
            if resource.get(field).is_some() {
                result.add_error(ValidationError::ServerOwnedField {
                    resource: path.clone(),
                    field: field.to_string(),
                });
            }
        }
        if let Some(props) = resource.get("properties").and_then(Value::as_object) {
            for field in PRUNED_PROPERTIES {
                if props.contains_key(*field) {
                    result.add_error(ValidationError::ServerOwnedField {
                        resource: path.clone(),
                        field: format!("properties.{}", field),
                    });
                }
            }
        }
        if resource.pointer("/identity/principalId").is_some() {
            result.add_error(ValidationError::ServerOwnedField {
                resource: path.clone(),
                field: "identity.principalId".to_string(),
            });
        }

        if let Some(location) = resource.pointer("/extendedLocation/name") {
            if location.as_str() != Some(CUSTOM_LOCATION_REF) {
                result.add_error(ValidationError::ForeignExtendedLocation {
                    resource: path.clone(),
                    found: location.to_string(),
                });
            }
        }

        if let Some(deps) = resource.get("dependsOn").and_then(Value::as_array) {
            for dep in deps {
                let dep = dep.as_str().unwrap_or_default();
                if !resources.contains_key(dep) {
                    result.add_error(ValidationError::UnresolvedDependency {
                        resource: path.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        if let Some(inner) = resource
            .pointer("/properties/template/resources")
            .and_then(Value::as_object)
        {
            check_resources(&format!("{}/", path), inner, result);
        }
    }
}

fn check_cycles(resources: &Map<String, Value>, result: &mut ValidationResult) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for key in resources.keys() {
        nodes.insert(key.as_str(), graph.add_node(key.as_str()));
    }
    for (key, resource) in resources {
        let deps = resource
            .get("dependsOn")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for dep in deps {
            if let Some(from) = nodes.get(dep) {
                graph.add_edge(*from, nodes[key.as_str()], ());
            }
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        result.add_error(ValidationError::DependencyCycle(
            graph[cycle.node_id()].to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "$schema": crate::template::DEPLOYMENT_TEMPLATE_SCHEMA,
            "languageVersion": "2.0",
            "contentVersion": "1.0.0.0",
            "metadata": {
                "opsCliVersion": "0.1.0",
                "clonedInstanceId": "/subscriptions/s/resourceGroups/g/providers/Microsoft.IoTOperations/instances/i"
            },
            "parameters": {"clusterName": {"type": "string"}},
            "resources": {
                "instance": {
                    "type": "Microsoft.IoTOperations/instances",
                    "apiVersion": "2024-11-01",
                    "name": "[parameters('instanceName')]",
                    "extendedLocation": {"name": CUSTOM_LOCATION_REF, "type": "CustomLocation"},
                    "properties": {}
                },
                "broker": {
                    "type": "Microsoft.IoTOperations/instances/brokers",
                    "apiVersion": "2024-11-01",
                    "name": "[concat(parameters('instanceName'), '/default')]",
                    "dependsOn": ["instance"]
                }
            }
        })
    }

    #[test]
    fn test_validate_minimal_template() {
        let result = validate_template_value(&minimal()).unwrap();
        assert!(result.valid, "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_validate_missing_metadata() {
        let mut template = minimal();
        template.as_object_mut().unwrap().remove("metadata");
        let result = validate_template_value(&template).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_validate_flags_server_fields() {
        let mut template = minimal();
        template["resources"]["instance"]["id"] = json!("/x");
        template["resources"]["instance"]["properties"]["provisioningState"] = json!("Succeeded");
        let result = validate_template_value(&template).unwrap();
        assert_eq!(
            result
                .errors
                .iter()
                .filter(|e| matches!(e, ValidationError::ServerOwnedField { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_validate_flags_foreign_location_in_nested_template() {
        let mut template = minimal();
        template["resources"]["assets_1"] = json!({
            "type": "Microsoft.Resources/deployments",
            "apiVersion": "2022-09-01",
            "name": "d",
            "properties": {"template": {"resources": {"asset_1": {
                "type": "Microsoft.DeviceRegistry/assets",
                "apiVersion": "2024-11-01",
                "name": "a",
                "extendedLocation": {"name": "/subscriptions/s/cl", "type": "CustomLocation"}
            }}}}
        });
        let result = validate_template_value(&template).unwrap();
        assert!(result.errors.iter().any(|e| matches!(
            e,
            ValidationError::ForeignExtendedLocation { resource, .. } if resource == "assets_1/asset_1"
        )));
    }

    #[test]
    fn test_validate_unresolved_and_cyclic_dependencies() {
        let mut template = minimal();
        template["resources"]["broker"]["dependsOn"] = json!(["instance", "missing"]);
        template["resources"]["instance"]["dependsOn"] = json!(["broker"]);
        let result = validate_template_value(&template).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnresolvedDependency { dependency, .. } if dependency == "missing")));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::DependencyCycle(_))));
    }
}
