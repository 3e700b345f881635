//! Symbolic resource graph: the in-memory form of a clone before emission.

use crate::resource::CapturedResource;
use crate::template::{
    shared_parameter_defs, shared_parameter_values, wrap_parameter_values, ParameterDef, Template,
    TemplateMetadata, DEPLOYMENTS_TYPE,
};
use aioclone_common::{Error, Result};
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Maximum number of resources wrapped by one nested deployment.
pub const CHUNK_LEN: usize = 800;

/// Api version of nested (inner) deployments.
pub const NESTED_DEPLOYMENT_API_VERSION: &str = "2022-09-01";

/// A single captured resource emitted inline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContainer {
    pub resource: CapturedResource,
    pub scope: Option<String>,
    pub depends_on: Vec<String>,
}

impl ResourceContainer {
    pub fn new(resource: CapturedResource) -> Self {
        Self {
            resource,
            scope: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn emit(&self) -> Result<Value> {
        let mut value = self.resource.to_value()?;
        if let Some(obj) = value.as_object_mut() {
            if let Some(scope) = &self.scope {
                obj.insert("scope".to_string(), json!(scope));
            }
            if !self.depends_on.is_empty() {
                obj.insert("dependsOn".to_string(), json!(self.depends_on));
            }
        }
        Ok(value)
    }
}

/// A nested `Microsoft.Resources/deployments` wrapping a batch of resources.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentContainer {
    /// Deployment name expression.
    pub name: String,
    pub api_version: String,
    pub resources: IndexMap<String, ResourceContainer>,
    /// Inner template parameter declarations.
    pub parameters: IndexMap<String, ParameterDef>,
    /// Values passed from the enclosing template.
    pub parameter_values: IndexMap<String, Value>,
    pub depends_on: Vec<String>,
    pub condition: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
}

impl DeploymentContainer {
    /// A deployment that forwards the shared parameters to its inner template.
    pub fn new(key: &str) -> Self {
        Self {
            name: deployment_name(key),
            api_version: NESTED_DEPLOYMENT_API_VERSION.to_string(),
            resources: IndexMap::new(),
            parameters: shared_parameter_defs(),
            parameter_values: shared_parameter_values(),
            depends_on: Vec::new(),
            condition: None,
            subscription_id: None,
            resource_group: None,
        }
    }

    /// The inner template this deployment carries.
    pub fn inner_template(&self) -> Result<Template> {
        let mut template = Template::new(self.parameters.clone());
        for (key, resource) in &self.resources {
            template.resources.insert(key.clone(), resource.emit()?);
        }
        Ok(template)
    }

    pub fn emit(&self) -> Result<Value> {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), json!(DEPLOYMENTS_TYPE));
        obj.insert("apiVersion".to_string(), json!(self.api_version));
        obj.insert("name".to_string(), json!(self.name));
        if let Some(condition) = &self.condition {
            obj.insert("condition".to_string(), json!(condition));
        }
        if let Some(subscription_id) = &self.subscription_id {
            obj.insert("subscriptionId".to_string(), json!(subscription_id));
        }
        if let Some(resource_group) = &self.resource_group {
            obj.insert("resourceGroup".to_string(), json!(resource_group));
        }
        obj.insert(
            "properties".to_string(),
            json!({
                "mode": "Incremental",
                "expressionEvaluationOptions": {"scope": "inner"},
                "parameters": wrap_parameter_values(&self.parameter_values),
                "template": serde_json::to_value(self.inner_template()?)?,
            }),
        );
        if !self.depends_on.is_empty() {
            obj.insert("dependsOn".to_string(), json!(self.depends_on));
        }
        Ok(Value::Object(obj))
    }
}

/// Number of deployments needed for `len` resources.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_LEN)
}

/// Key of the last deployment [`SymbolicGraph::insert_chunked`] adds for
/// `len` resources of `kind`, or `None` when the collection is empty.
pub fn last_chunk_key(kind: &str, len: usize) -> Option<String> {
    match chunk_count(len) {
        0 => None,
        n => Some(format!("{}_{}", kind, n)),
    }
}

/// Name expression of the nested deployment stored under `key`.
pub fn deployment_name(key: &str) -> String {
    format!("[concat('aio_', parameters('resourceSlug'), '_{}')]", key)
}

/// Either an inline resource or a nested deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum Container {
    Resource(ResourceContainer),
    Deployment(DeploymentContainer),
}

impl Container {
    pub fn emit(&self) -> Result<Value> {
        match self {
            Container::Resource(r) => r.emit(),
            Container::Deployment(d) => d.emit(),
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Container::Resource(r) => &r.depends_on,
            Container::Deployment(d) => &d.depends_on,
        }
    }
}

/// Insertion-ordered map from symbolic key to container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolicGraph {
    containers: IndexMap<String, Container>,
}

impl SymbolicGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a container under a key that must not already exist.
    pub fn insert(&mut self, key: impl Into<String>, container: Container) -> Result<()> {
        let key = key.into();
        if self.containers.contains_key(&key) {
            return Err(Error::Validation(format!(
                "Duplicate symbolic key '{}' in resource graph",
                key
            )));
        }
        self.containers.insert(key, container);
        Ok(())
    }

    /// Split `items` into deployments of at most [`CHUNK_LEN`] resources keyed
    /// `{kind}_1`, `{kind}_2`, ... Inner resources are keyed `{label}_{n}`.
    ///
    /// Returns the keys added; nothing is added for an empty collection.
    pub fn insert_chunked(
        &mut self,
        kind: &str,
        label: &str,
        items: Vec<ResourceContainer>,
        depends_on: &[String],
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut items = items.into_iter().peekable();
        let mut chunk_index = 0;
        let mut item_index = 0;

        while items.peek().is_some() {
            chunk_index += 1;
            let key = format!("{}_{}", kind, chunk_index);
            let mut deployment = DeploymentContainer::new(&key);
            deployment.depends_on = depends_on.to_vec();
            for item in items.by_ref().take(CHUNK_LEN) {
                item_index += 1;
                deployment
                    .resources
                    .insert(format!("{}_{}", label, item_index), item);
            }
            self.insert(key.clone(), Container::Deployment(deployment))?;
            keys.push(key);
        }

        Ok(keys)
    }

    pub fn get(&self, key: &str) -> Option<&Container> {
        self.containers.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.containers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Container)> {
        self.containers.iter().map(|(k, c)| (k.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Keys of the form `{kind}_{n}`, in ascending chunk order.
    pub fn keys_of_kind(&self, kind: &str) -> Vec<&str> {
        let mut keys: Vec<(usize, &str)> = self
            .containers
            .keys()
            .filter_map(|k| chunk_index(k, kind).map(|n| (n, k.as_str())))
            .collect();
        keys.sort_by_key(|(n, _)| *n);
        keys.into_iter().map(|(_, k)| k).collect()
    }

    /// The highest-numbered `{kind}_{n}` key, if any.
    pub fn last_of_kind(&self, kind: &str) -> Option<String> {
        self.keys_of_kind(kind).last().map(|k| k.to_string())
    }

    /// Fail if a `dependsOn` entry is unknown or the dependencies form a cycle.
    pub fn assert_acyclic(&self) -> Result<()> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for key in self.containers.keys() {
            nodes.insert(key.as_str(), graph.add_node(key.as_str()));
        }

        for (key, container) in &self.containers {
            let to = nodes[key.as_str()];
            for dep in container.depends_on() {
                let from = nodes.get(dep.as_str()).ok_or_else(|| {
                    Error::Validation(format!(
                        "Resource '{}' depends on unknown resource '{}'",
                        key, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            Error::Validation(format!(
                "Dependency cycle detected at resource '{}'",
                graph[cycle.node_id()]
            ))
        })
    }

    /// Emit the root template. The graph is left untouched, so repeated calls
    /// produce identical documents.
    pub fn to_template(
        &self,
        parameters: IndexMap<String, ParameterDef>,
        metadata: TemplateMetadata,
    ) -> Result<Template> {
        self.assert_acyclic()?;

        let mut template = Template::new(parameters);
        template.metadata = Some(metadata);
        for (key, container) in &self.containers {
            template.resources.insert(key.clone(), container.emit()?);
        }
        Ok(template)
    }
}

fn chunk_index(key: &str, kind: &str) -> Option<usize> {
    key.strip_prefix(kind)?.strip_prefix('_')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resource(name: &str) -> ResourceContainer {
        let captured = CapturedResource::capture(
            json!({"id": format!("/x/{}", name), "name": name, "type": "Microsoft.DeviceRegistry/assets"}),
            "2024-11-01",
        )
        .unwrap();
        ResourceContainer::new(captured)
    }

    #[test]
    fn test_chunk_sizes_and_keys() {
        let mut graph = SymbolicGraph::new();
        let items: Vec<_> = (0..1000).map(|i| resource(&format!("a{}", i))).collect();
        let keys = graph.insert_chunked("assets", "asset", items, &[]).unwrap();
        assert_eq!(keys, vec!["assets_1", "assets_2"]);

        let sizes: Vec<usize> = keys
            .iter()
            .map(|k| match graph.get(k).unwrap() {
                Container::Deployment(d) => d.resources.len(),
                Container::Resource(_) => 0,
            })
            .collect();
        assert_eq!(sizes, vec![800, 200]);
        assert_eq!(graph.last_of_kind("assets").as_deref(), Some("assets_2"));
        assert_eq!(last_chunk_key("assets", 1000), graph.last_of_kind("assets"));
        assert_eq!(graph.last_of_kind("assetEndpointProfiles"), None);
    }

    #[test]
    fn test_chunk_count_boundaries() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(800), 1);
        assert_eq!(chunk_count(801), 2);
        assert_eq!(last_chunk_key("authzs", 0), None);
        assert_eq!(last_chunk_key("authzs", 3).as_deref(), Some("authzs_1"));
    }

    #[test]
    fn test_empty_collection_adds_nothing() {
        let mut graph = SymbolicGraph::new();
        let keys = graph.insert_chunked("assets", "asset", vec![], &[]).unwrap();
        assert!(keys.is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_keys_of_kind_orders_by_chunk_number() {
        let mut graph = SymbolicGraph::new();
        for key in ["listeners_10", "listeners_2", "listenersX_1", "listeners_1"] {
            graph
                .insert(key, Container::Resource(resource(key)))
                .unwrap();
        }
        assert_eq!(
            graph.keys_of_kind("listeners"),
            vec!["listeners_1", "listeners_2", "listeners_10"]
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut graph = SymbolicGraph::new();
        graph.insert("broker", Container::Resource(resource("b"))).unwrap();
        assert!(graph.insert("broker", Container::Resource(resource("b"))).is_err());
    }

    #[test]
    fn test_assert_acyclic_detects_unknown_and_cycles() {
        let mut graph = SymbolicGraph::new();
        graph
            .insert(
                "a",
                Container::Resource(resource("a").with_depends_on(vec!["b".to_string()])),
            )
            .unwrap();
        assert!(graph.assert_acyclic().is_err());

        graph
            .insert(
                "b",
                Container::Resource(resource("b").with_depends_on(vec!["a".to_string()])),
            )
            .unwrap();
        let err = graph.assert_acyclic().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_deployment_emit_shape() {
        let mut deployment = DeploymentContainer::new("assets_1");
        deployment
            .resources
            .insert("asset_1".to_string(), resource("a1"));
        deployment.depends_on = vec!["instance".to_string()];
        let value = deployment.emit().unwrap();

        assert_eq!(value["type"], DEPLOYMENTS_TYPE);
        assert_eq!(value["apiVersion"], NESTED_DEPLOYMENT_API_VERSION);
        assert_eq!(
            value["name"],
            "[concat('aio_', parameters('resourceSlug'), '_assets_1')]"
        );
        assert_eq!(value["properties"]["mode"], "Incremental");
        assert_eq!(
            value["properties"]["expressionEvaluationOptions"]["scope"],
            "inner"
        );
        assert_eq!(
            value["properties"]["parameters"]["instanceName"]["value"],
            "[parameters('instanceName')]"
        );
        assert_eq!(
            value["properties"]["template"]["resources"]["asset_1"]["name"],
            "a1"
        );
        assert_eq!(value["dependsOn"], json!(["instance"]));
        assert!(value.get("condition").is_none());
    }
}
