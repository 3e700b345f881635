//! Canned source instances served through a [`MockTransport`], for tests.

use crate::enumerator::{InstanceCapture, ResourceEnumerator};
use crate::version::VersionGuru;
use aioclone_arm::mock::{mock_env, MockTransport};
use aioclone_arm::{ArmClient, Method};
use aioclone_common::Result;
use serde_json::{json, Value};
use std::sync::Arc;

pub const SUBSCRIPTION: &str = "sub";
pub const RESOURCE_GROUP: &str = "rg";
pub const INSTANCE_NAME: &str = "ops1";
pub const CUSTOM_LOCATION_NAME: &str = "cl1";
pub const CLUSTER_NAME: &str = "arc1";
pub const NAMESPACE: &str = "azure-iot-operations";
pub const LOCATION: &str = "eastus";
pub const OPS_EXTENSION_NAME: &str = "azure-iot-operations-x7k2q";

/// Collection sizes and switches for a generated source instance.
#[derive(Debug, Clone)]
pub struct SourceShape {
    pub version: String,
    pub brokers: usize,
    pub listeners: usize,
    pub authns: usize,
    pub authzs: usize,
    pub dataflow_profiles: usize,
    pub dataflows_per_profile: usize,
    pub dataflow_endpoints: usize,
    pub secret_provider_classes: usize,
    pub secret_syncs: usize,
    /// Add one SPC and one SecretSync bound to another custom location.
    pub foreign_secret_resources: bool,
    pub asset_endpoint_profiles: usize,
    pub assets: usize,
    pub schema_registry: bool,
    pub ops_extension_bound: bool,
}

impl SourceShape {
    /// One broker with one listener and one authentication, one dataflow
    /// profile without dataflows, one endpoint, nothing else.
    pub fn minimal() -> Self {
        Self {
            version: "1.0.34".to_string(),
            brokers: 1,
            listeners: 1,
            authns: 1,
            authzs: 0,
            dataflow_profiles: 1,
            dataflows_per_profile: 0,
            dataflow_endpoints: 1,
            secret_provider_classes: 0,
            secret_syncs: 0,
            foreign_secret_resources: false,
            asset_endpoint_profiles: 0,
            assets: 0,
            schema_registry: true,
            ops_extension_bound: true,
        }
    }
}

fn rg_scope() -> String {
    format!("/subscriptions/{}/resourceGroups/{}", SUBSCRIPTION, RESOURCE_GROUP)
}

pub fn instance_id() -> String {
    format!(
        "{}/providers/Microsoft.IoTOperations/instances/{}",
        rg_scope(),
        INSTANCE_NAME
    )
}

pub fn custom_location_id() -> String {
    format!(
        "{}/providers/Microsoft.ExtendedLocation/customLocations/{}",
        rg_scope(),
        CUSTOM_LOCATION_NAME
    )
}

pub fn cluster_id() -> String {
    format!(
        "{}/providers/Microsoft.Kubernetes/connectedClusters/{}",
        rg_scope(),
        CLUSTER_NAME
    )
}

pub fn extension_id(name: &str) -> String {
    format!(
        "{}/providers/Microsoft.KubernetesConfiguration/extensions/{}",
        cluster_id(),
        name
    )
}

pub fn uami_id(name: &str) -> String {
    format!(
        "{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
        rg_scope(),
        name
    )
}

pub fn schema_registry_id() -> String {
    format!(
        "/subscriptions/{}/resourceGroups/registry-rg/providers/Microsoft.DeviceRegistry/schemaRegistries/registry1",
        SUBSCRIPTION
    )
}

fn bound_to(custom_location: &str) -> Value {
    json!({"name": custom_location, "type": "CustomLocation"})
}

fn system_data() -> Value {
    json!({"createdBy": "someone@example.com", "createdAt": "2024-11-20T10:00:00Z"})
}

fn child(parent: &str, segment: &str, name: &str, resource_type: &str, properties: Value) -> Value {
    json!({
        "id": format!("{}/{}/{}", parent, segment, name),
        "name": name,
        "type": resource_type,
        "extendedLocation": bound_to(&custom_location_id()),
        "systemData": system_data(),
        "properties": properties,
    })
}

fn list(values: Vec<Value>) -> Value {
    json!({ "value": values })
}

fn extension(name: &str, extension_type: &str, release_namespace: &str) -> Value {
    json!({
        "id": extension_id(name),
        "name": name,
        "type": "Microsoft.KubernetesConfiguration/extensions",
        "identity": {"type": "SystemAssigned", "principalId": format!("{}-principal", name)},
        "systemData": system_data(),
        "properties": {
            "extensionType": extension_type,
            "autoUpgradeMinorVersion": false,
            "releaseTrain": "stable",
            "version": "1.0.9",
            "scope": {"cluster": {"releaseNamespace": release_namespace}},
            "configurationSettings": {"rbac.cluster.admin": "true"},
            "provisioningState": "Succeeded",
            "installedVersion": "1.0.9",
            "isSystemExtension": false,
            "statuses": []
        }
    })
}

fn instance(shape: &SourceShape) -> Value {
    let mut properties = json!({
        "version": shape.version,
        "description": "line 3 instance",
        "features": {"connectors": {"mode": "Stable"}},
        "provisioningState": "Succeeded"
    });
    if shape.schema_registry {
        properties["schemaRegistryRef"] = json!({"resourceId": schema_registry_id()});
    }
    let mut identities = serde_json::Map::new();
    identities.insert(
        uami_id("uami-dataflow"),
        json!({"principalId": "p1", "clientId": "c1"}),
    );
    json!({
        "id": instance_id(),
        "name": INSTANCE_NAME,
        "type": "Microsoft.IoTOperations/instances",
        "location": LOCATION,
        "extendedLocation": bound_to(&custom_location_id()),
        "identity": {"type": "UserAssigned", "userAssignedIdentities": identities},
        "tags": {"site": "line3"},
        "systemData": system_data(),
        "properties": properties,
    })
}

fn custom_location(shape: &SourceShape) -> Value {
    let mut bound = vec![
        extension_id("azure-iot-operations-platform"),
        extension_id("azure-secret-store"),
    ];
    if shape.ops_extension_bound {
        bound.push(extension_id(OPS_EXTENSION_NAME));
    }
    json!({
        "id": custom_location_id(),
        "name": CUSTOM_LOCATION_NAME,
        "type": "Microsoft.ExtendedLocation/customLocations",
        "location": LOCATION,
        "systemData": system_data(),
        "properties": {
            "hostResourceId": cluster_id(),
            "namespace": NAMESPACE,
            "displayName": CUSTOM_LOCATION_NAME,
            "hostType": "Kubernetes",
            "clusterExtensionIds": bound,
            "provisioningState": "Succeeded"
        }
    })
}

fn top_level(provider_type: &str, graph_type: &str, name: &str, properties: Value, on: &str) -> Value {
    json!({
        "id": format!("{}/providers/{}/{}", rg_scope(), provider_type, name),
        "name": name,
        "type": graph_type,
        "location": LOCATION,
        "resourceGroup": RESOURCE_GROUP,
        "subscriptionId": SUBSCRIPTION,
        "extendedLocation": bound_to(on),
        "systemData": system_data(),
        "properties": properties,
    })
}

/// Register every route a capture of `shape` needs.
pub fn seed(transport: &MockTransport, shape: &SourceShape) {
    let instance_path = instance_id();
    let broker_path = format!("{}/brokers/default", instance_path);
    let foreign_location = custom_location_id().replace(CUSTOM_LOCATION_NAME, "other-cl");

    transport.on(Method::Get, "/instances/ops1?", 200, instance(shape));
    transport.on(Method::Get, "/customLocations/cl1?", 200, custom_location(shape));
    transport.on(
        Method::Get,
        "/connectedClusters/arc1/providers/Microsoft.KubernetesConfiguration/extensions?",
        200,
        list(vec![
            extension("azure-iot-operations-platform", "microsoft.iotoperations.platform", "cert-manager"),
            extension("azure-arc-containerstorage", "microsoft.arc.containerstorage", "kube-system"),
            extension("azure-secret-store", "microsoft.azure.secretstore", "azure-secret-store"),
            extension(OPS_EXTENSION_NAME, "microsoft.iotoperations", NAMESPACE),
            extension("flux", "microsoft.flux", "flux-system"),
        ]),
    );

    let brokers = (0..shape.brokers)
        .map(|i| {
            let name = if i == 0 { "default".to_string() } else { format!("broker{}", i) };
            child(
                &instance_path,
                "brokers",
                &name,
                "Microsoft.IoTOperations/instances/brokers",
                json!({"memoryProfile": "Medium", "provisioningState": "Succeeded"}),
            )
        })
        .collect();
    transport.on(Method::Get, "/instances/ops1/brokers?", 200, list(brokers));

    for (segment, count, resource_type, properties) in [
        (
            "listeners",
            shape.listeners,
            "Microsoft.IoTOperations/instances/brokers/listeners",
            json!({"serviceType": "ClusterIp", "ports": [{"port": 18883}], "provisioningState": "Succeeded"}),
        ),
        (
            "authentications",
            shape.authns,
            "Microsoft.IoTOperations/instances/brokers/authentications",
            json!({"authenticationMethods": [{"method": "ServiceAccountToken"}]}),
        ),
        (
            "authorizations",
            shape.authzs,
            "Microsoft.IoTOperations/instances/brokers/authorizations",
            json!({"authorizationPolicies": {"cache": "Enabled"}}),
        ),
    ] {
        let items = (1..=count)
            .map(|i| {
                child(
                    &broker_path,
                    segment,
                    &format!("{}{}", segment.trim_end_matches('s'), i),
                    resource_type,
                    properties.clone(),
                )
            })
            .collect();
        transport.on(
            Method::Get,
            &format!("/brokers/default/{}?", segment),
            200,
            list(items),
        );
    }

    let profile_names: Vec<String> = (1..=shape.dataflow_profiles)
        .map(|i| format!("profile{}", i))
        .collect();
    let profiles = profile_names
        .iter()
        .map(|name| {
            child(
                &instance_path,
                "dataflowProfiles",
                name,
                "Microsoft.IoTOperations/instances/dataflowProfiles",
                json!({"instanceCount": 1, "provisioningState": "Succeeded"}),
            )
        })
        .collect();
    transport.on(Method::Get, "/instances/ops1/dataflowProfiles?", 200, list(profiles));
    for profile in &profile_names {
        let profile_path = format!("{}/dataflowProfiles/{}", instance_path, profile);
        let dataflows = (1..=shape.dataflows_per_profile)
            .map(|i| {
                child(
                    &profile_path,
                    "dataflows",
                    &format!("dataflow{}", i),
                    "Microsoft.IoTOperations/instances/dataflowProfiles/dataflows",
                    json!({"mode": "Enabled", "operations": []}),
                )
            })
            .collect();
        transport.on(
            Method::Get,
            &format!("/dataflowProfiles/{}/dataflows?", profile),
            200,
            list(dataflows),
        );
    }

    let endpoints = (1..=shape.dataflow_endpoints)
        .map(|i| {
            child(
                &instance_path,
                "dataflowEndpoints",
                &format!("endpoint{}", i),
                "Microsoft.IoTOperations/instances/dataflowEndpoints",
                json!({"endpointType": "Mqtt", "mqttSettings": {"host": "aio-broker:18883"}}),
            )
        })
        .collect();
    transport.on(Method::Get, "/instances/ops1/dataflowEndpoints?", 200, list(endpoints));

    let mut spcs: Vec<Value> = (1..=shape.secret_provider_classes)
        .map(|i| {
            top_level(
                "Microsoft.SecretSyncController/azureKeyVaultSecretProviderClasses",
                "Microsoft.SecretSyncController/azureKeyVaultSecretProviderClasses",
                &format!("spc{}", i),
                json!({"clientId": format!("spc-client-{}", i), "keyvaultName": "kv1", "tenantId": "t"}),
                &custom_location_id(),
            )
        })
        .collect();
    let mut syncs: Vec<Value> = (1..=shape.secret_syncs)
        .map(|i| {
            top_level(
                "Microsoft.SecretSyncController/secretSyncs",
                "Microsoft.SecretSyncController/secretSyncs",
                &format!("sync{}", i),
                json!({"secretProviderClassName": "spc1", "serviceAccountName": "aio-ssc-sa"}),
                &custom_location_id(),
            )
        })
        .collect();
    if shape.foreign_secret_resources {
        spcs.push(top_level(
            "Microsoft.SecretSyncController/azureKeyVaultSecretProviderClasses",
            "Microsoft.SecretSyncController/azureKeyVaultSecretProviderClasses",
            "foreign-spc",
            json!({"clientId": "foreign-client"}),
            &foreign_location,
        ));
        syncs.push(top_level(
            "Microsoft.SecretSyncController/secretSyncs",
            "Microsoft.SecretSyncController/secretSyncs",
            "foreign-sync",
            json!({}),
            &foreign_location,
        ));
    }
    transport.on(Method::Get, "/azureKeyVaultSecretProviderClasses?", 200, list(spcs));
    transport.on(Method::Get, "/secretSyncs?", 200, list(syncs));

    let profiles: Vec<Value> = (1..=shape.asset_endpoint_profiles)
        .map(|i| {
            top_level(
                "Microsoft.DeviceRegistry/assetEndpointProfiles",
                "microsoft.deviceregistry/assetendpointprofiles",
                &format!("aep-{:04}", i),
                json!({"targetAddress": format!("opc.tcp://plc-{}:50000", i), "endpointProfileType": "OpcUa", "uuid": "u"}),
                &custom_location_id(),
            )
        })
        .collect();
    let assets: Vec<Value> = (1..=shape.assets)
        .map(|i| {
            top_level(
                "Microsoft.DeviceRegistry/assets",
                "microsoft.deviceregistry/assets",
                &format!("asset-{:04}", i),
                json!({"assetEndpointProfileRef": "aep-0001", "enabled": true, "provisioningState": "Succeeded"}),
                &custom_location_id(),
            )
        })
        .collect();
    let graph = "Microsoft.ResourceGraph/resources";
    transport.on_body(Method::Post, graph, "deviceregistry/assetendpointprofiles'", 200, json!({"data": profiles}));
    transport.on_body(Method::Post, graph, "deviceregistry/assets'", 200, json!({"data": assets}));
    transport.on_body(
        Method::Post,
        graph,
        "userassignedidentities",
        200,
        json!({"data": [{"id": uami_id("uami-secrets")}, {"id": uami_id("UAMI-DATAFLOW")}]}),
    );
}

/// Seed a fresh mock with `shape` and capture it.
pub async fn capture(shape: &SourceShape) -> Result<InstanceCapture> {
    let transport = Arc::new(MockTransport::new());
    seed(&transport, shape);
    let arm = ArmClient::new(mock_env(transport));
    ResourceEnumerator::new(&arm, VersionGuru::default())
        .enumerate(RESOURCE_GROUP, INSTANCE_NAME)
        .await
}
