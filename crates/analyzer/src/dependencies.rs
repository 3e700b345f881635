//! Symbolic keys and the `dependsOn` rules between them.

use crate::enumerator::{ExtensionKind, InstanceCapture};
use aioclone_template::last_chunk_key;

pub const CUSTOM_LOCATION_KEY: &str = "customLocation";
pub const INSTANCE_KEY: &str = "instance";
pub const BROKER_KEY: &str = "broker";
pub const ROLE_ASSIGNMENTS_KEY: &str = "roleAssignments_1";

/// A chunked collection, emitted as `{kind}_{n}` deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Listeners,
    Authns,
    Authzs,
    DataflowProfiles,
    DataflowEndpoints,
    Dataflows,
    SecretProviderClasses,
    SecretSyncs,
    AssetEndpointProfiles,
    Assets,
}

impl Collection {
    /// All collections in emission order.
    pub const ALL: [Collection; 10] = [
        Collection::Listeners,
        Collection::Authns,
        Collection::Authzs,
        Collection::DataflowProfiles,
        Collection::DataflowEndpoints,
        Collection::Dataflows,
        Collection::SecretProviderClasses,
        Collection::SecretSyncs,
        Collection::AssetEndpointProfiles,
        Collection::Assets,
    ];

    /// Prefix of the deployment keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Collection::Listeners => "listeners",
            Collection::Authns => "authns",
            Collection::Authzs => "authzs",
            Collection::DataflowProfiles => "dataflowProfiles",
            Collection::DataflowEndpoints => "dataflowEndpoints",
            Collection::Dataflows => "dataflows",
            Collection::SecretProviderClasses => "secretProviderClasss",
            Collection::SecretSyncs => "secretSyncs",
            Collection::AssetEndpointProfiles => "assetEndpointProfiles",
            Collection::Assets => "assets",
        }
    }

    /// Prefix of the resource keys inside each deployment.
    pub fn label(&self) -> &'static str {
        match self {
            Collection::Listeners => "listener",
            Collection::Authns => "authn",
            Collection::Authzs => "authz",
            Collection::DataflowProfiles => "dataflowProfile",
            Collection::DataflowEndpoints => "dataflowEndpoint",
            Collection::Dataflows => "dataflow",
            Collection::SecretProviderClasses => "secretProviderClass",
            Collection::SecretSyncs => "secretSync",
            Collection::AssetEndpointProfiles => "assetEndpointProfile",
            Collection::Assets => "asset",
        }
    }

    /// Children of the instance get names relative to `instanceName`.
    pub fn is_instance_child(&self) -> bool {
        matches!(
            self,
            Collection::Listeners
                | Collection::Authns
                | Collection::Authzs
                | Collection::DataflowProfiles
                | Collection::DataflowEndpoints
                | Collection::Dataflows
        )
    }
}

/// Collection sizes, enough to know every deployment key before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    counts: [usize; 10],
}

impl ChunkPlan {
    pub fn new(counts: [usize; 10]) -> Self {
        Self { counts }
    }

    pub fn from_capture(capture: &InstanceCapture) -> Self {
        Self::new([
            capture.listeners.len(),
            capture.authns.len(),
            capture.authzs.len(),
            capture.dataflow_profiles.len(),
            capture.dataflow_endpoints.len(),
            capture.dataflows.len(),
            capture.secret_provider_classes.len(),
            capture.secret_syncs.len(),
            capture.asset_endpoint_profiles.len(),
            capture.assets.len(),
        ])
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.counts[collection as usize]
    }

    /// Key of the last deployment of a collection.
    pub fn last(&self, collection: Collection) -> Option<String> {
        last_chunk_key(collection.kind(), self.count(collection))
    }

    /// `dependsOn` shared by every deployment of `collection`.
    ///
    /// A dependency on another collection always names its last deployment,
    /// and falls away when that collection is empty.
    pub fn depends_on(&self, collection: Collection) -> Vec<String> {
        let fixed = |key: &str| Some(key.to_string());
        let deps = match collection {
            Collection::Listeners => vec![
                fixed(BROKER_KEY),
                self.last(Collection::Authns),
                self.last(Collection::Authzs),
            ],
            Collection::Authns | Collection::Authzs => vec![fixed(BROKER_KEY)],
            Collection::DataflowProfiles | Collection::DataflowEndpoints => {
                vec![fixed(INSTANCE_KEY)]
            }
            Collection::Dataflows => {
                let deps = vec![
                    self.last(Collection::DataflowProfiles),
                    self.last(Collection::DataflowEndpoints),
                ];
                if deps.iter().all(Option::is_none) {
                    vec![fixed(INSTANCE_KEY)]
                } else {
                    deps
                }
            }
            Collection::SecretProviderClasses => vec![fixed(CUSTOM_LOCATION_KEY)],
            Collection::SecretSyncs => vec![self
                .last(Collection::SecretProviderClasses)
                .or_else(|| fixed(CUSTOM_LOCATION_KEY))],
            Collection::AssetEndpointProfiles => {
                vec![fixed(INSTANCE_KEY), self.last(Collection::Listeners)]
            }
            Collection::Assets => vec![
                self.last(Collection::AssetEndpointProfiles),
                fixed(INSTANCE_KEY),
            ],
        };
        deps.into_iter().flatten().collect()
    }
}

/// `dependsOn` of an extension given the extensions that were captured.
pub fn extension_depends_on(kind: ExtensionKind, present: &[ExtensionKind]) -> Vec<String> {
    let wanted: &[ExtensionKind] = match kind {
        ExtensionKind::Platform => &[],
        ExtensionKind::ContainerStorage | ExtensionKind::SecretStore => &[ExtensionKind::Platform],
        ExtensionKind::IotOperations => &[
            ExtensionKind::Platform,
            ExtensionKind::ContainerStorage,
            ExtensionKind::SecretStore,
        ],
    };
    wanted
        .iter()
        .filter(|k| present.contains(*k))
        .map(|k| k.key().to_string())
        .collect()
}
