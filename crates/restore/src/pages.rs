//! Splitting a template into deployment pages.
//!
//! Device Registry chunk deployments can be large, so they are pulled out of
//! the root template. The root page goes first and every pulled-out chunk
//! follows as its own page, in template order.

use aioclone_common::{Error, Result};
use aioclone_template::{Template, DEPLOYMENTS_TYPE};
use serde_json::Value;

const ASSET_TYPE: &str = "microsoft.deviceregistry/assets";
const ASSET_ENDPOINT_PROFILE_TYPE: &str = "microsoft.deviceregistry/assetendpointprofiles";

/// Which Device Registry collection a chunk deployment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Assets,
    AssetEndpointProfiles,
}

impl ExternalKind {
    /// File stem prefix for linked templates.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            ExternalKind::Assets => "assets",
            ExternalKind::AssetEndpointProfiles => "assetendpointprofiles",
        }
    }

    fn from_resource_type(resource_type: &str) -> Option<Self> {
        if resource_type.eq_ignore_ascii_case(ASSET_TYPE) {
            Some(ExternalKind::Assets)
        } else if resource_type.eq_ignore_ascii_case(ASSET_ENDPOINT_PROFILE_TYPE) {
            Some(ExternalKind::AssetEndpointProfiles)
        } else {
            None
        }
    }
}

/// A nested deployment of the root template that is moved out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalChunk {
    pub key: String,
    pub kind: ExternalKind,
    /// 1-based chunk index taken from the symbolic key.
    pub index: usize,
}

impl ExternalChunk {
    /// `<kind>_<n>.json`
    pub fn file_name(&self) -> String {
        format!("{}_{}.json", self.kind.file_prefix(), self.index)
    }
}

/// The kind of chunk a root resource is, if it is a nested deployment whose
/// inner resources are all assets or all asset endpoint profiles.
fn external_kind(resource: &Value) -> Option<ExternalKind> {
    let is_deployment = resource
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case(DEPLOYMENTS_TYPE))
        .unwrap_or(false);
    if !is_deployment {
        return None;
    }

    let inner = resource
        .pointer("/properties/template/resources")
        .and_then(Value::as_object)?;
    let mut kinds = inner.values().map(|r| {
        r.get("type")
            .and_then(Value::as_str)
            .and_then(ExternalKind::from_resource_type)
    });
    let first = kinds.next()??;
    kinds.all(|k| k == Some(first)).then_some(first)
}

fn chunk_index(key: &str) -> usize {
    key.rsplit_once('_')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(1)
}

/// Asset and asset endpoint profile chunk deployments of `template`, in order.
pub fn external_chunks(template: &Template) -> Vec<ExternalChunk> {
    template
        .resources
        .iter()
        .filter_map(|(key, resource)| {
            external_kind(resource).map(|kind| ExternalChunk {
                key: key.clone(),
                kind,
                index: chunk_index(key),
            })
        })
        .collect()
}

/// One deployment to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentPage {
    /// Symbolic key of the chunk this page was cut from; `None` for the root.
    pub source_key: Option<String>,
    pub template: Template,
}

/// Split `template` into the root page followed by one page per asset or
/// asset endpoint profile chunk.
///
/// A chunk page keeps the inner template of its deployment, takes the root
/// parameter declarations so it accepts the same parameter values, and
/// drops `dependsOn` entries that do not resolve within the page.
pub fn split_pages(template: &Template) -> Result<Vec<DeploymentPage>> {
    let chunks = external_chunks(template);

    let mut root = template.clone();
    let mut chunk_pages = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let resource = root.resources.shift_remove(&chunk.key).ok_or_else(|| {
            Error::Other(format!("Deployment {} vanished while paging", chunk.key))
        })?;
        let inner = resource
            .pointer("/properties/template")
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!("Deployment {} has no inner template.", chunk.key))
            })?;

        let mut page: Template = serde_json::from_value(inner)?;
        page.parameters = template.parameters.clone();
        page.metadata = template.metadata.clone();
        prune_dangling_depends_on(&mut page);
        chunk_pages.push(DeploymentPage {
            source_key: Some(chunk.key.clone()),
            template: page,
        });
    }
    prune_dangling_depends_on(&mut root);

    let mut pages = vec![DeploymentPage {
        source_key: None,
        template: root,
    }];
    pages.extend(chunk_pages);
    Ok(pages)
}

fn prune_dangling_depends_on(template: &mut Template) {
    let keys: Vec<String> = template.resources.keys().cloned().collect();
    for resource in template.resources.values_mut() {
        let Some(deps) = resource.get_mut("dependsOn").and_then(Value::as_array_mut) else {
            continue;
        };
        deps.retain(|d| d.as_str().map(|d| keys.iter().any(|k| k == d)).unwrap_or(false));
        if deps.is_empty() {
            if let Some(obj) = resource.as_object_mut() {
                obj.remove("dependsOn");
            }
        }
    }
}
