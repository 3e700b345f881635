//! Template builder: turn a capture into the symbolic graph and template.

use crate::api_versions;
use crate::dependencies::{
    extension_depends_on, ChunkPlan, Collection, BROKER_KEY, CUSTOM_LOCATION_KEY, INSTANCE_KEY,
    ROLE_ASSIGNMENTS_KEY,
};
use crate::enumerator::{ExtensionKind, InstanceCapture};
use aioclone_common::{Error, ResourceId, Result};
use aioclone_template::{
    validate_template, CapturedResource, Container, DeploymentContainer, ParameterDef,
    ParameterType, ResourceContainer, SymbolicGraph, Template, TemplateMetadata,
};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Azure built-in "Contributor" role definition.
pub const CONTRIBUTOR_ROLE_ID: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

/// Scope of cluster extensions on the target connected cluster.
pub const CLUSTER_SCOPE: &str =
    "[format('Microsoft.Kubernetes/connectedClusters/{0}', parameters('clusterName'))]";

/// Id of the target connected cluster.
pub const CLUSTER_RESOURCE_ID: &str =
    "[resourceId('Microsoft.Kubernetes/connectedClusters', parameters('clusterName'))]";

/// Rewritten `schemaRegistryRef.resourceId` of the instance.
pub const SCHEMA_REGISTRY_REF: &str = "[resourceId(parameters('schemaRegistryId').subscription, parameters('schemaRegistryId').resourceGroup, 'Microsoft.DeviceRegistry/schemaRegistries', parameters('schemaRegistryId').name)]";

/// Runtime principal of the deployed AIO extension.
pub const EXTENSION_PRINCIPAL_REF: &str =
    "[reference('iotOperations', '2023-05-01', 'Full').identity.principalId]";

/// Read-only extension properties that a PUT must not carry.
const EXTENSION_READ_ONLY: &[&str] = &[
    "installedVersion",
    "isSystemExtension",
    "aksAssignedIdentity",
    "errorInfo",
    "customLocationSettings",
    "packageUri",
    "configurationProtectedSettings",
];

/// Read-only identity fields besides `principalId`.
const IDENTITY_READ_ONLY: &[&str] = &["tenantId"];

/// Version recorded in template metadata.
pub fn ops_cli_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Declarations of the root template parameters, in emission order.
pub fn build_parameters(capture: &InstanceCapture) -> Result<IndexMap<String, ParameterDef>> {
    let string = |value: &str| ParameterDef::with_default(ParameterType::String, json!(value));
    let namespace = capture.namespace().ok_or_else(|| {
        Error::Validation(format!(
            "Custom location {} has no namespace.",
            capture.custom_location.name
        ))
    })?;
    let location = capture
        .instance
        .location
        .as_deref()
        .or(capture.custom_location.location.as_deref())
        .unwrap_or("[resourceGroup().location]");

    let mut params = IndexMap::new();
    params.insert(
        "clusterName".to_string(),
        ParameterDef::required(ParameterType::String),
    );
    params.insert("clusterNamespace".to_string(), string(namespace));
    params.insert(
        "customLocationName".to_string(),
        string(&capture.custom_location.name),
    );
    params.insert("instanceName".to_string(), string(&capture.instance.name));
    params.insert("location".to_string(), string(location));
    params.insert(
        "opsExtensionName".to_string(),
        string(&capture.extensions.iot_operations.name),
    );
    params.insert(
        "resourceSlug".to_string(),
        string("[take(uniqueString(resourceGroup().id, parameters('clusterName'), parameters('clusterNamespace')), 5)]"),
    );
    if let Some(registry) = capture.schema_registry_id() {
        let registry: ResourceId = registry.parse()?;
        params.insert(
            "schemaRegistryId".to_string(),
            ParameterDef::with_default(
                ParameterType::Object,
                json!({
                    "subscription": registry.subscription,
                    "resourceGroup": registry.resource_group,
                    "name": registry.name,
                }),
            ),
        );
    }
    params.insert(
        "applyRoleAssignments".to_string(),
        ParameterDef::with_default(ParameterType::Bool, json!(true)),
    );
    Ok(params)
}

/// Build the symbolic graph in canonical key order.
pub fn build_graph(capture: &InstanceCapture) -> Result<SymbolicGraph> {
    let mut graph = SymbolicGraph::new();

    let present: Vec<ExtensionKind> = capture.extensions.iter().map(|(k, _)| k).collect();
    for (kind, extension) in capture.extensions.iter() {
        let container = ResourceContainer::new(rewrite_extension(kind, extension))
            .with_scope(CLUSTER_SCOPE)
            .with_depends_on(extension_depends_on(kind, &present));
        graph.insert(kind.key(), Container::Resource(container))?;
    }

    let extension_keys: Vec<String> = present.iter().map(|k| k.key().to_string()).collect();
    graph.insert(
        CUSTOM_LOCATION_KEY,
        Container::Resource(
            ResourceContainer::new(rewrite_custom_location(capture))
                .with_depends_on(extension_keys),
        ),
    )?;

    graph.insert(
        INSTANCE_KEY,
        Container::Resource(
            ResourceContainer::new(rewrite_instance(capture))
                .with_depends_on(vec![CUSTOM_LOCATION_KEY.to_string()]),
        ),
    )?;

    if capture.schema_registry_id().is_some() {
        graph.insert(
            ROLE_ASSIGNMENTS_KEY,
            Container::Deployment(schema_registry_role_assignment()),
        )?;
    }

    graph.insert(
        BROKER_KEY,
        Container::Resource(
            ResourceContainer::new(instance_child(&capture.broker)?)
                .with_depends_on(vec![INSTANCE_KEY.to_string()]),
        ),
    )?;

    let plan = ChunkPlan::from_capture(capture);
    for collection in Collection::ALL {
        let items = collection_items(capture, collection)
            .iter()
            .map(|res| {
                let rewritten = if collection.is_instance_child() {
                    instance_child(res)?
                } else {
                    retargeted(res)
                };
                Ok(ResourceContainer::new(rewritten))
            })
            .collect::<Result<Vec<_>>>()?;
        let keys = graph.insert_chunked(
            collection.kind(),
            collection.label(),
            items,
            &plan.depends_on(collection),
        )?;
        if !keys.is_empty() {
            debug!("{} -> {:?}", collection.kind(), keys);
        }
    }

    Ok(graph)
}

/// Build, emit and validate the root template.
pub fn build_template(capture: &InstanceCapture) -> Result<Template> {
    let graph = build_graph(capture)?;
    let metadata = TemplateMetadata {
        ops_cli_version: ops_cli_version().to_string(),
        cloned_instance_id: capture.instance.source_id.clone(),
    };
    let template = graph.to_template(build_parameters(capture)?, metadata)?;

    let report = validate_template(&template).map_err(|e| Error::Validation(e.to_string()))?;
    if !report.valid {
        let reasons: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::Validation(format!(
            "Generated template is invalid: {}",
            reasons.join("; ")
        )));
    }
    Ok(template)
}

fn collection_items(capture: &InstanceCapture, collection: Collection) -> &[CapturedResource] {
    match collection {
        Collection::Listeners => &capture.listeners,
        Collection::Authns => &capture.authns,
        Collection::Authzs => &capture.authzs,
        Collection::DataflowProfiles => &capture.dataflow_profiles,
        Collection::DataflowEndpoints => &capture.dataflow_endpoints,
        Collection::Dataflows => &capture.dataflows,
        Collection::SecretProviderClasses => &capture.secret_provider_classes,
        Collection::SecretSyncs => &capture.secret_syncs,
        Collection::AssetEndpointProfiles => &capture.asset_endpoint_profiles,
        Collection::Assets => &capture.assets,
    }
}

/// ARM string literal escaping.
fn arm_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn extension_name_expr(kind: ExtensionKind, extension: &CapturedResource) -> String {
    match kind {
        ExtensionKind::IotOperations => "parameters('opsExtensionName')".to_string(),
        _ => format!("'{}'", arm_literal(&extension.name)),
    }
}

fn rewrite_extension(kind: ExtensionKind, extension: &CapturedResource) -> CapturedResource {
    let mut res = extension.clone();
    if let Some(props) = res.properties.as_object_mut() {
        for key in EXTENSION_READ_ONLY {
            props.remove(*key);
        }
    }
    strip_identity(&mut res);

    if kind == ExtensionKind::IotOperations {
        res.name = "[parameters('opsExtensionName')]".to_string();
        if let Some(namespace) = res.properties.pointer_mut("/scope/cluster/releaseNamespace") {
            *namespace = json!("[parameters('clusterNamespace')]");
        }
    }
    res
}

fn rewrite_custom_location(capture: &InstanceCapture) -> CapturedResource {
    let source = &capture.custom_location;
    let extension_ids: Vec<String> = capture
        .extensions
        .iter()
        .map(|(kind, ext)| {
            format!(
                "[extensionResourceId({}, 'Microsoft.KubernetesConfiguration/extensions', {})]",
                CLUSTER_RESOURCE_ID.trim_start_matches('[').trim_end_matches(']'),
                extension_name_expr(kind, ext)
            )
        })
        .collect();

    let mut res = source.clone();
    res.name = "[parameters('customLocationName')]".to_string();
    res.location = Some("[parameters('location')]".to_string());
    res.properties = json!({
        "hostResourceId": CLUSTER_RESOURCE_ID,
        "namespace": "[parameters('clusterNamespace')]",
        "displayName": "[parameters('customLocationName')]",
        "hostType": source.property_str("/hostType").unwrap_or("Kubernetes"),
        "clusterExtensionIds": extension_ids,
    });
    res
}

fn rewrite_instance(capture: &InstanceCapture) -> CapturedResource {
    let mut res = capture.instance.clone();
    res.name = "[parameters('instanceName')]".to_string();
    res.location = Some("[parameters('location')]".to_string());
    res.retarget_extended_location();
    strip_identity(&mut res);

    if let Some(reference) = res.properties.pointer_mut("/schemaRegistryRef/resourceId") {
        *reference = json!(SCHEMA_REGISTRY_REF);
    }
    if !capture.version.emit_features {
        if let Some(props) = res.properties.as_object_mut() {
            props.remove("features");
        }
    }
    res
}

/// Drop read-only identity fields; user-assigned entries become `{}`.
fn strip_identity(res: &mut CapturedResource) {
    if let Some(Value::Object(identity)) = res.identity.as_mut() {
        for key in IDENTITY_READ_ONLY {
            identity.remove(*key);
        }
        if let Some(Value::Object(assigned)) = identity.get_mut("userAssignedIdentities") {
            for value in assigned.values_mut() {
                *value = Value::Object(Map::new());
            }
        }
    }
}

/// An instance child named relative to `parameters('instanceName')`.
fn instance_child(source: &CapturedResource) -> Result<CapturedResource> {
    let id = source.resource_id()?;
    let mut res = retargeted(source);
    res.name = format!(
        "[concat(parameters('instanceName'), '{}')]",
        arm_literal(&id.child_suffix())
    );
    Ok(res)
}

fn retargeted(source: &CapturedResource) -> CapturedResource {
    let mut res = source.clone();
    res.retarget_extended_location();
    res
}

/// Nested deployment granting the AIO extension principal Contributor on the
/// schema registry, in the registry's resource group.
fn schema_registry_role_assignment() -> DeploymentContainer {
    let mut deployment = DeploymentContainer::new(ROLE_ASSIGNMENTS_KEY);
    deployment.condition = Some("[parameters('applyRoleAssignments')]".to_string());
    deployment.subscription_id = Some("[parameters('schemaRegistryId').subscription]".to_string());
    deployment.resource_group = Some("[parameters('schemaRegistryId').resourceGroup]".to_string());
    deployment.depends_on = vec![ExtensionKind::IotOperations.key().to_string()];

    for name in ["principalId", "schemaRegistryName"] {
        deployment
            .parameters
            .insert(name.to_string(), ParameterDef::required(ParameterType::String));
    }
    deployment
        .parameter_values
        .insert("principalId".to_string(), json!(EXTENSION_PRINCIPAL_REF));
    deployment.parameter_values.insert(
        "schemaRegistryName".to_string(),
        json!("[parameters('schemaRegistryId').name]"),
    );

    let assignment = CapturedResource::synthetic(
        "Microsoft.Authorization/roleAssignments",
        api_versions::ROLE_ASSIGNMENT,
        &format!(
            "[guid(parameters('principalId'), resourceId('Microsoft.DeviceRegistry/schemaRegistries', parameters('schemaRegistryName')), '{}')]",
            CONTRIBUTOR_ROLE_ID
        ),
        json!({
            "roleDefinitionId": format!(
                "[subscriptionResourceId('Microsoft.Authorization/roleDefinitions', '{}')]",
                CONTRIBUTOR_ROLE_ID
            ),
            "principalId": "[parameters('principalId')]",
            "principalType": "ServicePrincipal",
        }),
    );
    deployment.resources.insert(
        "schemaRegistryRoleAssignment".to_string(),
        ResourceContainer::new(assignment).with_scope(
            "[format('Microsoft.DeviceRegistry/schemaRegistries/{0}', parameters('schemaRegistryName'))]",
        ),
    );
    deployment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, SourceShape};
    use aioclone_template::CUSTOM_LOCATION_REF;
    use pretty_assertions::assert_eq;

    async fn template_for(shape: SourceShape) -> Template {
        let capture = fixtures::capture(&shape).await.unwrap();
        build_template(&capture).unwrap()
    }

    fn keys(template: &Template) -> Vec<&str> {
        template.resources.keys().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn test_minimal_instance_key_order() {
        let template = template_for(SourceShape::minimal()).await;
        assert_eq!(
            keys(&template),
            vec![
                "platform",
                "containerStorage",
                "secretStore",
                "iotOperations",
                "customLocation",
                "instance",
                "roleAssignments_1",
                "broker",
                "listeners_1",
                "authns_1",
                "dataflowProfiles_1",
                "dataflowEndpoints_1",
            ]
        );
    }

    #[tokio::test]
    async fn test_full_instance_key_order() {
        let shape = SourceShape {
            authzs: 1,
            dataflows_per_profile: 2,
            secret_provider_classes: 1,
            secret_syncs: 1,
            asset_endpoint_profiles: 1,
            assets: 1,
            ..SourceShape::minimal()
        };
        let template = template_for(shape).await;
        assert_eq!(
            &keys(&template)[7..],
            &[
                "broker",
                "listeners_1",
                "authns_1",
                "authzs_1",
                "dataflowProfiles_1",
                "dataflowEndpoints_1",
                "dataflows_1",
                "secretProviderClasss_1",
                "secretSyncs_1",
                "assetEndpointProfiles_1",
                "assets_1",
            ]
        );
        assert_eq!(
            template.resources["listeners_1"]["dependsOn"],
            json!(["broker", "authns_1", "authzs_1"])
        );
        assert_eq!(
            template.resources["dataflows_1"]["dependsOn"],
            json!(["dataflowProfiles_1", "dataflowEndpoints_1"])
        );
        assert_eq!(
            template.resources["secretSyncs_1"]["dependsOn"],
            json!(["secretProviderClasss_1"])
        );
    }

    #[tokio::test]
    async fn test_large_inventory_is_chunked() {
        let shape = SourceShape {
            asset_endpoint_profiles: 1000,
            assets: 1000,
            ..SourceShape::minimal()
        };
        let template = template_for(shape).await;
        let chunked: Vec<&str> = keys(&template)
            .into_iter()
            .filter(|k| k.starts_with("asset"))
            .collect();
        assert_eq!(
            chunked,
            vec![
                "assetEndpointProfiles_1",
                "assetEndpointProfiles_2",
                "assets_1",
                "assets_2"
            ]
        );
        for key in ["assets_1", "assets_2"] {
            assert_eq!(
                template.resources[key]["dependsOn"],
                json!(["assetEndpointProfiles_2", "instance"])
            );
        }
        assert_eq!(
            template.resources["assetEndpointProfiles_1"]["dependsOn"],
            json!(["instance", "listeners_1"])
        );
        let inner = template.resources["assets_2"]["properties"]["template"]["resources"]
            .as_object()
            .unwrap();
        assert_eq!(inner.len(), 200);
        assert!(inner.contains_key("asset_1000"));
        assert_eq!(inner["asset_801"]["type"], "Microsoft.DeviceRegistry/assets");
    }

    #[tokio::test]
    async fn test_rewrites() {
        let template = template_for(SourceShape::minimal()).await;
        let r = &template.resources;

        assert_eq!(r["instance"]["name"], "[parameters('instanceName')]");
        assert_eq!(r["instance"]["location"], "[parameters('location')]");
        assert_eq!(r["instance"]["extendedLocation"]["name"], CUSTOM_LOCATION_REF);
        assert_eq!(
            r["instance"]["properties"]["schemaRegistryRef"]["resourceId"],
            SCHEMA_REGISTRY_REF
        );
        assert!(r["instance"]["properties"].get("features").is_none());
        assert_eq!(r["instance"]["apiVersion"], "2024-11-01");
        assert_eq!(
            r["instance"]["identity"]["userAssignedIdentities"][fixtures::uami_id("uami-dataflow")],
            json!({})
        );
        assert_eq!(
            r["broker"]["name"],
            "[concat(parameters('instanceName'), '/default')]"
        );
        assert_eq!(
            r["listeners_1"]["properties"]["template"]["resources"]["listener_1"]["name"],
            "[concat(parameters('instanceName'), '/default/listener1')]"
        );
        assert_eq!(r["iotOperations"]["name"], "[parameters('opsExtensionName')]");
        assert_eq!(r["iotOperations"]["scope"], CLUSTER_SCOPE);
        assert_eq!(
            r["iotOperations"]["properties"]["scope"]["cluster"]["releaseNamespace"],
            "[parameters('clusterNamespace')]"
        );
        assert!(r["iotOperations"]["properties"].get("installedVersion").is_none());
        assert_eq!(
            r["platform"]["properties"]["scope"]["cluster"]["releaseNamespace"],
            "cert-manager"
        );
        assert_eq!(
            r["iotOperations"]["dependsOn"],
            json!(["platform", "containerStorage", "secretStore"])
        );
        assert_eq!(r["customLocation"]["properties"]["hostResourceId"], CLUSTER_RESOURCE_ID);
        assert_eq!(
            r["customLocation"]["properties"]["clusterExtensionIds"][3],
            "[extensionResourceId(resourceId('Microsoft.Kubernetes/connectedClusters', parameters('clusterName')), 'Microsoft.KubernetesConfiguration/extensions', parameters('opsExtensionName'))]"
        );
        assert_eq!(r["customLocation"]["dependsOn"].as_array().unwrap().len(), 4);
        assert_eq!(r["instance"]["dependsOn"], json!(["customLocation"]));
    }

    #[tokio::test]
    async fn test_features_kept_for_newer_instances() {
        let shape = SourceShape {
            version: "1.1.5".to_string(),
            ..SourceShape::minimal()
        };
        let template = template_for(shape).await;
        assert_eq!(template.resources["instance"]["apiVersion"], "2025-04-01");
        assert!(template.resources["instance"]["properties"]
            .get("features")
            .is_some());
        assert_eq!(
            template.resources["broker"]["apiVersion"],
            "2025-04-01"
        );
    }

    #[tokio::test]
    async fn test_role_assignment_deployment() {
        let template = template_for(SourceShape::minimal()).await;
        let ra = &template.resources["roleAssignments_1"];
        assert_eq!(ra["condition"], "[parameters('applyRoleAssignments')]");
        assert_eq!(ra["resourceGroup"], "[parameters('schemaRegistryId').resourceGroup]");
        assert_eq!(
            ra["properties"]["parameters"]["principalId"]["value"],
            EXTENSION_PRINCIPAL_REF
        );
        let inner = &ra["properties"]["template"]["resources"]["schemaRegistryRoleAssignment"];
        assert_eq!(inner["type"], "Microsoft.Authorization/roleAssignments");
        assert_eq!(inner["properties"]["principalType"], "ServicePrincipal");
        assert!(inner["properties"]["roleDefinitionId"]
            .as_str()
            .unwrap()
            .contains(CONTRIBUTOR_ROLE_ID));

        let params = &template.parameters;
        assert_eq!(
            params["schemaRegistryId"].default_value,
            Some(json!({"subscription": "sub", "resourceGroup": "registry-rg", "name": "registry1"}))
        );
        assert_eq!(params["applyRoleAssignments"].default_value, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_no_schema_registry_no_role_assignment() {
        let shape = SourceShape {
            schema_registry: false,
            ..SourceShape::minimal()
        };
        let template = template_for(shape).await;
        assert!(!template.resources.contains_key("roleAssignments_1"));
        assert!(!template.parameters.contains_key("schemaRegistryId"));
    }

    #[tokio::test]
    async fn test_parameters_and_metadata() {
        let template = template_for(SourceShape::minimal()).await;
        let names: Vec<&str> = template.parameters.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "clusterName",
                "clusterNamespace",
                "customLocationName",
                "instanceName",
                "location",
                "opsExtensionName",
                "resourceSlug",
                "schemaRegistryId",
                "applyRoleAssignments",
            ]
        );
        assert_eq!(template.parameters["clusterName"].default_value, None);
        assert_eq!(
            template.parameters["opsExtensionName"].default_value,
            Some(json!(fixtures::OPS_EXTENSION_NAME))
        );
        let metadata = template.metadata.as_ref().unwrap();
        assert_eq!(metadata.cloned_instance_id, fixtures::instance_id());
        assert!(!metadata.ops_cli_version.is_empty());
    }

    #[tokio::test]
    async fn test_emit_is_repeatable() {
        let capture = fixtures::capture(&SourceShape::minimal()).await.unwrap();
        let first = build_template(&capture).unwrap().to_pretty_json().unwrap();
        let second = build_template(&capture).unwrap().to_pretty_json().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_no_server_owned_fields_emitted() {
        let shape = SourceShape {
            secret_provider_classes: 1,
            assets: 2,
            ..SourceShape::minimal()
        };
        let json = template_for(shape).await.to_pretty_json().unwrap();
        for needle in ["\"id\"", "systemData", "provisioningState", "principalId\": \"p", "\"status\""] {
            assert!(!json.contains(needle), "found {}", needle);
        }
    }
}
