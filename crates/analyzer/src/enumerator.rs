//! Resource enumeration: walk a live instance and capture its resource tree.

use crate::api_versions;
use crate::version::{VersionGuru, VersionInfo};
use aioclone_arm::ArmClient;
use aioclone_common::{ids_match, Error, ResourceId, Result};
use aioclone_template::CapturedResource;
use serde_json::Value;
use tracing::{debug, info};

/// Role an extension plays in an AIO deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Platform,
    ContainerStorage,
    SecretStore,
    IotOperations,
}

impl ExtensionKind {
    /// All kinds in emission order.
    pub const ALL: [ExtensionKind; 4] = [
        ExtensionKind::Platform,
        ExtensionKind::ContainerStorage,
        ExtensionKind::SecretStore,
        ExtensionKind::IotOperations,
    ];

    /// Symbolic key of the emitted extension.
    pub fn key(&self) -> &'static str {
        match self {
            ExtensionKind::Platform => "platform",
            ExtensionKind::ContainerStorage => "containerStorage",
            ExtensionKind::SecretStore => "secretStore",
            ExtensionKind::IotOperations => "iotOperations",
        }
    }

    /// Classify by `properties.extensionType`, case-insensitively.
    pub fn from_extension_type(extension_type: &str) -> Option<Self> {
        match extension_type.to_ascii_lowercase().as_str() {
            "microsoft.iotoperations.platform" => Some(ExtensionKind::Platform),
            "microsoft.arc.containerstorage" => Some(ExtensionKind::ContainerStorage),
            "microsoft.azure.secretstore" => Some(ExtensionKind::SecretStore),
            "microsoft.iotoperations" => Some(ExtensionKind::IotOperations),
            _ => None,
        }
    }
}

/// The cluster extensions an instance relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterExtensions {
    pub platform: Option<CapturedResource>,
    pub container_storage: Option<CapturedResource>,
    pub secret_store: Option<CapturedResource>,
    pub iot_operations: CapturedResource,
}

impl ClusterExtensions {
    pub fn get(&self, kind: ExtensionKind) -> Option<&CapturedResource> {
        match kind {
            ExtensionKind::Platform => self.platform.as_ref(),
            ExtensionKind::ContainerStorage => self.container_storage.as_ref(),
            ExtensionKind::SecretStore => self.secret_store.as_ref(),
            ExtensionKind::IotOperations => Some(&self.iot_operations),
        }
    }

    /// Captured extensions in emission order.
    pub fn iter(&self) -> impl Iterator<Item = (ExtensionKind, &CapturedResource)> {
        ExtensionKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|ext| (kind, ext)))
    }
}

/// Everything captured from one source instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceCapture {
    pub instance: CapturedResource,
    pub version: VersionInfo,
    pub custom_location: CapturedResource,
    /// Connected cluster hosting the source custom location.
    pub cluster_id: String,
    pub extensions: ClusterExtensions,
    pub broker: CapturedResource,
    pub listeners: Vec<CapturedResource>,
    pub authns: Vec<CapturedResource>,
    pub authzs: Vec<CapturedResource>,
    pub dataflow_profiles: Vec<CapturedResource>,
    pub dataflow_endpoints: Vec<CapturedResource>,
    pub dataflows: Vec<CapturedResource>,
    pub secret_provider_classes: Vec<CapturedResource>,
    pub secret_syncs: Vec<CapturedResource>,
    pub asset_endpoint_profiles: Vec<CapturedResource>,
    pub assets: Vec<CapturedResource>,
    /// User-assigned identities to federate, first-seen order, no duplicates.
    pub user_assigned_identities: Vec<String>,
}

impl InstanceCapture {
    /// Namespace of the source custom location.
    pub fn namespace(&self) -> Option<&str> {
        self.custom_location.property_str("/namespace")
    }

    /// Source schema registry id, when the instance references one.
    pub fn schema_registry_id(&self) -> Option<&str> {
        self.instance.property_str("/schemaRegistryRef/resourceId")
    }
}

/// Walks a source instance through ARM and Resource Graph.
///
/// Calls are issued one after another; later queries are built from earlier
/// responses.
pub struct ResourceEnumerator<'a> {
    arm: &'a ArmClient,
    guru: VersionGuru,
}

impl<'a> ResourceEnumerator<'a> {
    pub fn new(arm: &'a ArmClient, guru: VersionGuru) -> Self {
        Self { arm, guru }
    }

    /// Capture the instance `name` in `resource_group`.
    pub async fn enumerate(&self, resource_group: &str, name: &str) -> Result<InstanceCapture> {
        let env = self.arm.env();
        let instance_id = ResourceId::new(
            &env.subscription_id,
            resource_group,
            "Microsoft.IoTOperations",
            "instances",
            name,
        );
        let instance_path = instance_id.to_string();

        info!("Capturing instance {}", instance_path);
        let mut raw_instance = self
            .arm
            .get(&instance_path, api_versions::INSTANCE_2024_11)
            .await?;
        let version = self.guru.check(&raw_instance, &env.session)?;
        let api = version.instance_api_version;
        if api != api_versions::INSTANCE_2024_11 {
            raw_instance = self.arm.get(&instance_path, api).await?;
        }
        let instance = CapturedResource::capture(raw_instance, api)?;

        let custom_location_id = instance
            .extended_location
            .as_ref()
            .map(|loc| loc.name.clone())
            .ok_or_else(|| {
                Error::Validation(format!("Instance {} has no extendedLocation.", name))
            })?;
        let custom_location = CapturedResource::capture(
            self.arm
                .get(&custom_location_id, api_versions::CUSTOM_LOCATION)
                .await?,
            api_versions::CUSTOM_LOCATION,
        )?;
        let cluster_id = custom_location
            .property_str("/hostResourceId")
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Custom location {} has no hostResourceId.",
                    custom_location.name
                ))
            })?;
        let extensions = self.extensions(&cluster_id, &custom_location).await?;

        let broker = self.broker(&instance_path, api).await?;
        let broker_path = broker.source_id.clone();
        let listeners = self.children(&broker_path, "listeners", api).await?;
        let authns = self.children(&broker_path, "authentications", api).await?;
        let authzs = self.children(&broker_path, "authorizations", api).await?;

        let dataflow_profiles = self.children(&instance_path, "dataflowProfiles", api).await?;
        let mut dataflows = Vec::new();
        for profile in &dataflow_profiles {
            dataflows.extend(self.children(&profile.source_id, "dataflows", api).await?);
        }
        let dataflow_endpoints = self
            .children(&instance_path, "dataflowEndpoints", api)
            .await?;

        let rg_path = instance_id.resource_group_id();
        let secret_provider_classes = self
            .on_custom_location(
                &rg_path,
                "providers/Microsoft.SecretSyncController/azureKeyVaultSecretProviderClasses",
                &custom_location_id,
            )
            .await?;
        let secret_syncs = self
            .on_custom_location(
                &rg_path,
                "providers/Microsoft.SecretSyncController/secretSyncs",
                &custom_location_id,
            )
            .await?;

        let asset_endpoint_profiles = self
            .device_registry(
                &custom_location_id,
                "microsoft.deviceregistry/assetendpointprofiles",
                "Microsoft.DeviceRegistry/assetEndpointProfiles",
            )
            .await?;
        let assets = self
            .device_registry(
                &custom_location_id,
                "microsoft.deviceregistry/assets",
                "Microsoft.DeviceRegistry/assets",
            )
            .await?;

        let user_assigned_identities = self
            .user_assigned_identities(&instance, &secret_provider_classes)
            .await?;

        info!(
            "Captured {} listener(s), {} dataflow(s), {} asset endpoint profile(s), {} asset(s)",
            listeners.len(),
            dataflows.len(),
            asset_endpoint_profiles.len(),
            assets.len()
        );

        Ok(InstanceCapture {
            instance,
            version,
            custom_location,
            cluster_id,
            extensions,
            broker,
            listeners,
            authns,
            authzs,
            dataflow_profiles,
            dataflow_endpoints,
            dataflows,
            secret_provider_classes,
            secret_syncs,
            asset_endpoint_profiles,
            assets,
            user_assigned_identities,
        })
    }

    async fn children(
        &self,
        parent: &str,
        type_suffix: &str,
        api_version: &str,
    ) -> Result<Vec<CapturedResource>> {
        let items = self.arm.list(parent, type_suffix, api_version).await?;
        debug!("{} {} under {}", items.len(), type_suffix, parent);
        items
            .into_iter()
            .map(|item| CapturedResource::capture(item, api_version))
            .collect()
    }

    async fn broker(&self, instance_path: &str, api_version: &str) -> Result<CapturedResource> {
        let mut brokers = self.children(instance_path, "brokers", api_version).await?;
        if brokers.len() != 1 {
            return Err(Error::Validation(format!(
                "Expected exactly one broker on the instance, found {}.",
                brokers.len()
            )));
        }
        Ok(brokers.remove(0))
    }

    async fn extensions(
        &self,
        cluster_id: &str,
        custom_location: &CapturedResource,
    ) -> Result<ClusterExtensions> {
        let listed = self
            .children(
                cluster_id,
                "providers/Microsoft.KubernetesConfiguration/extensions",
                api_versions::EXTENSION,
            )
            .await?;
        let bound: Vec<&str> = custom_location
            .properties
            .get("clusterExtensionIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let is_bound = |ext: &CapturedResource| bound.iter().any(|id| ids_match(id, &ext.source_id));

        let mut found: [Option<CapturedResource>; 4] = Default::default();
        for ext in listed {
            let kind = match ext
                .property_str("/extensionType")
                .and_then(ExtensionKind::from_extension_type)
            {
                Some(kind) => kind,
                None => continue,
            };
            let slot = &mut found[kind as usize];
            let replace = match slot.as_ref() {
                None => kind != ExtensionKind::IotOperations || is_bound(&ext),
                Some(current) => !is_bound(current) && is_bound(&ext),
            };
            if replace {
                debug!("Using extension {} as {}", ext.name, kind.key());
                *slot = Some(ext);
            }
        }

        let [platform, container_storage, secret_store, iot_operations] = found;
        let iot_operations = iot_operations.ok_or_else(|| {
            Error::NotFound(format!(
                "No IoT Operations extension bound to custom location {} on cluster {}.",
                custom_location.name, cluster_id
            ))
        })?;

        Ok(ClusterExtensions {
            platform,
            container_storage,
            secret_store,
            iot_operations,
        })
    }

    async fn on_custom_location(
        &self,
        rg_path: &str,
        type_suffix: &str,
        custom_location_id: &str,
    ) -> Result<Vec<CapturedResource>> {
        let mut items = self
            .children(rg_path, type_suffix, api_versions::SECRET_SYNC)
            .await?;
        items.retain(|item| item.is_on_custom_location(custom_location_id));
        Ok(items)
    }

    async fn device_registry(
        &self,
        custom_location_id: &str,
        graph_type: &str,
        provider_type: &str,
    ) -> Result<Vec<CapturedResource>> {
        let query = format!(
            "Resources | where extendedLocation.name =~ {} | where type =~ {} | order by id asc",
            kql_quote(custom_location_id),
            kql_quote(graph_type)
        );
        self.arm
            .query_resource_graph(&query)
            .await?
            .into_iter()
            .map(|row| {
                CapturedResource::capture(row, api_versions::DEVICE_REGISTRY)
                    .map(|res| res.with_type(provider_type))
            })
            .collect()
    }

    async fn user_assigned_identities(
        &self,
        instance: &CapturedResource,
        secret_provider_classes: &[CapturedResource],
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = instance
            .identity
            .as_ref()
            .and_then(|identity| identity.get("userAssignedIdentities"))
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();

        let client_ids: Vec<&str> = secret_provider_classes
            .iter()
            .filter_map(|spc| spc.property_str("/clientId"))
            .filter(|id| !id.is_empty())
            .collect();
        if !client_ids.is_empty() {
            let query = format!(
                "Resources | where type =~ 'microsoft.managedidentity/userassignedidentities' | where properties.clientId in~ ({}) | project id",
                client_ids
                    .iter()
                    .map(|id| kql_quote(id))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let rows = self.arm.query_resource_graph(&query).await?;
            ids.extend(
                rows.iter()
                    .filter_map(|row| row.get("id").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }

        Ok(dedup_ids(ids))
    }
}

/// Single-quoted KQL string literal.
pub fn kql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Drop case-insensitive duplicates, keeping first-seen order.
pub fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.iter().any(|seen| ids_match(seen, &id)) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, SourceShape};
    use aioclone_arm::mock::{mock_env, MockTransport};
    use aioclone_arm::Method;
    use aioclone_common::ErrorKind;
    use std::sync::Arc;

    async fn enumerate(shape: &SourceShape, force: bool) -> (Result<InstanceCapture>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        fixtures::seed(&transport, shape);
        let arm = ArmClient::new(mock_env(transport.clone()));
        let result = ResourceEnumerator::new(&arm, VersionGuru::new(force))
            .enumerate(fixtures::RESOURCE_GROUP, fixtures::INSTANCE_NAME)
            .await;
        (result, transport)
    }

    #[tokio::test]
    async fn test_minimal_capture() {
        let (capture, _) = enumerate(&SourceShape::minimal(), false).await;
        let capture = capture.unwrap();

        assert_eq!(capture.instance.name, fixtures::INSTANCE_NAME);
        assert_eq!(capture.broker.name, "default");
        assert_eq!(capture.listeners.len(), 1);
        assert_eq!(capture.authns.len(), 1);
        assert!(capture.authzs.is_empty());
        assert_eq!(capture.dataflow_profiles.len(), 1);
        assert_eq!(capture.dataflow_endpoints.len(), 1);
        assert!(capture.assets.is_empty());
        assert_eq!(capture.namespace(), Some(fixtures::NAMESPACE));
        assert_eq!(capture.cluster_id, fixtures::cluster_id());
        assert_eq!(
            capture.extensions.iter().map(|(k, _)| k.key()).collect::<Vec<_>>(),
            vec!["platform", "containerStorage", "secretStore", "iotOperations"]
        );
        assert_eq!(capture.extensions.iot_operations.name, fixtures::OPS_EXTENSION_NAME);
        assert_eq!(capture.user_assigned_identities, vec![fixtures::uami_id("uami-dataflow")]);
        assert!(capture.instance.to_value().unwrap().get("id").is_none());
    }

    #[tokio::test]
    async fn test_secret_resources_filtered_by_custom_location() {
        let shape = SourceShape {
            secret_provider_classes: 2,
            secret_syncs: 2,
            foreign_secret_resources: true,
            ..SourceShape::minimal()
        };
        let (capture, transport) = enumerate(&shape, false).await;
        let capture = capture.unwrap();

        assert_eq!(capture.secret_provider_classes.len(), 2);
        assert_eq!(capture.secret_syncs.len(), 2);
        assert_eq!(
            capture.user_assigned_identities,
            vec![
                fixtures::uami_id("uami-dataflow"),
                fixtures::uami_id("uami-secrets")
            ]
        );
        let lookups = transport.requests_matching(Method::Post, "Microsoft.ResourceGraph");
        let uami_query = lookups
            .iter()
            .filter_map(|r| r.body.as_ref())
            .filter_map(|b| b["query"].as_str())
            .find(|q| q.contains("userassignedidentities"))
            .unwrap()
            .to_string();
        assert!(uami_query.contains("in~ ('spc-client-1', 'spc-client-2')"));
    }

    #[tokio::test]
    async fn test_device_registry_types_are_restored() {
        let shape = SourceShape {
            asset_endpoint_profiles: 3,
            assets: 5,
            ..SourceShape::minimal()
        };
        let (capture, _) = enumerate(&shape, false).await;
        let capture = capture.unwrap();
        assert_eq!(capture.assets.len(), 5);
        assert_eq!(capture.assets[0].resource_type, "Microsoft.DeviceRegistry/assets");
        assert_eq!(
            capture.asset_endpoint_profiles[2].resource_type,
            "Microsoft.DeviceRegistry/assetEndpointProfiles"
        );
        assert_eq!(capture.assets[0].api_version, "2024-11-01");
    }

    #[tokio::test]
    async fn test_two_brokers_rejected() {
        let shape = SourceShape {
            brokers: 2,
            ..SourceShape::minimal()
        };
        let (result, _) = enumerate(&shape, false).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("exactly one broker"));
    }

    #[tokio::test]
    async fn test_version_gate_runs_before_walk() {
        let shape = SourceShape {
            version: "1.2.0".to_string(),
            ..SourceShape::minimal()
        };
        let (result, transport) = enumerate(&shape, false).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("not compatible with instance version 1.2.0"));
        assert_eq!(transport.requests().len(), 1);

        let (forced, transport) = enumerate(&shape, true).await;
        let forced = forced.unwrap();
        assert_eq!(forced.version.instance_api_version, "2025-04-01");
        assert_eq!(
            transport
                .requests_matching(Method::Get, "/brokers?api-version=2025-04-01")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_found() {
        let transport = Arc::new(MockTransport::new());
        let arm = ArmClient::new(mock_env(transport));
        let err = ResourceEnumerator::new(&arm, VersionGuru::default())
            .enumerate("rg", "missing")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unbound_ops_extension_is_not_found() {
        let shape = SourceShape {
            ops_extension_bound: false,
            ..SourceShape::minimal()
        };
        let (result, _) = enumerate(&shape, false).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_kql_quote_and_dedup() {
        assert_eq!(kql_quote("a'b"), r"'a\'b'");
        let ids = dedup_ids(vec!["/A/b".to_string(), "/a/B".to_string(), "/c".to_string()]);
        assert_eq!(ids, vec!["/A/b".to_string(), "/c".to_string()]);
    }

    #[test]
    fn test_extension_kind_detection() {
        assert_eq!(
            ExtensionKind::from_extension_type("Microsoft.IoTOperations"),
            Some(ExtensionKind::IotOperations)
        );
        assert_eq!(
            ExtensionKind::from_extension_type("microsoft.arc.containerstorage"),
            Some(ExtensionKind::ContainerStorage)
        );
        assert_eq!(ExtensionKind::from_extension_type("microsoft.flux"), None);
    }
}
