//! ARM resource id parsing.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed ARM resource id.
///
/// `/subscriptions/{s}/resourceGroups/{g}/providers/{ns}/{type}/{name}[/{childType}/{childName}]*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceId {
    pub subscription: String,
    pub resource_group: String,
    pub namespace: String,
    pub resource_type: String,
    pub name: String,
    pub children: Vec<(String, String)>,
}

impl ResourceId {
    /// Build a top-level resource id.
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        namespace: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Return a copy with one more child segment appended.
    pub fn child(&self, child_type: impl Into<String>, child_name: impl Into<String>) -> Self {
        let mut id = self.clone();
        id.children.push((child_type.into(), child_name.into()));
        id
    }

    /// Full provider type, e.g. `Microsoft.IoTOperations/instances/brokers`.
    pub fn full_type(&self) -> String {
        let mut t = format!("{}/{}", self.namespace, self.resource_type);
        for (child_type, _) in &self.children {
            t.push('/');
            t.push_str(child_type);
        }
        t
    }

    /// Name of the deepest segment.
    pub fn leaf_name(&self) -> &str {
        self.children
            .last()
            .map(|(_, n)| n.as_str())
            .unwrap_or(&self.name)
    }

    /// Child names below the top-level resource joined with `/`, each
    /// prefixed by `/`. Empty for top-level ids.
    ///
    /// `.../instances/i1/brokers/default/listeners/l1` gives `/default/l1`.
    pub fn child_suffix(&self) -> String {
        self.children
            .iter()
            .map(|(_, n)| format!("/{}", n))
            .collect()
    }

    /// The parent id, or `None` for a top-level resource.
    pub fn parent(&self) -> Option<Self> {
        if self.children.is_empty() {
            return None;
        }
        let mut id = self.clone();
        id.children.pop();
        Some(id)
    }

    /// The top-level resource this id belongs to.
    pub fn root(&self) -> Self {
        let mut id = self.clone();
        id.children.clear();
        id
    }

    /// `/subscriptions/{s}/resourceGroups/{g}`.
    pub fn resource_group_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.subscription, self.resource_group
        )
    }

    /// Case-insensitive equality, the way ARM compares ids.
    pub fn matches(&self, other: &str) -> bool {
        ids_match(&self.to_string(), other)
    }
}

/// Compare two resource ids the way ARM does (case-insensitive).
pub fn ids_match(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription, self.resource_group, self.namespace, self.resource_type, self.name
        )?;
        for (child_type, child_name) in &self.children {
            write!(f, "/{}/{}", child_type, child_name)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidResourceId(s.to_string());
        let segments: Vec<&str> = s.trim().trim_matches('/').split('/').collect();

        if segments.len() < 8 || segments.iter().any(|seg| seg.is_empty()) {
            return Err(invalid());
        }
        if !segments[0].eq_ignore_ascii_case("subscriptions")
            || !segments[2].eq_ignore_ascii_case("resourceGroups")
            || !segments[4].eq_ignore_ascii_case("providers")
        {
            return Err(invalid());
        }

        let rest = &segments[8..];
        if rest.len() % 2 != 0 {
            return Err(invalid());
        }
        let children = rest
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();

        Ok(ResourceId {
            subscription: segments[1].to_string(),
            resource_group: segments[3].to_string(),
            namespace: segments[5].to_string(),
            resource_type: segments[6].to_string(),
            name: segments[7].to_string(),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTENER: &str = "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.IoTOperations/instances/ops1/brokers/default/listeners/default";

    #[test]
    fn test_parse_child_resource() {
        let id: ResourceId = LISTENER.parse().unwrap();
        assert_eq!(id.subscription, "sub1");
        assert_eq!(id.resource_group, "rg1");
        assert_eq!(id.namespace, "Microsoft.IoTOperations");
        assert_eq!(id.resource_type, "instances");
        assert_eq!(id.name, "ops1");
        assert_eq!(id.children.len(), 2);
        assert_eq!(
            id.full_type(),
            "Microsoft.IoTOperations/instances/brokers/listeners"
        );
        assert_eq!(id.leaf_name(), "default");
        assert_eq!(id.child_suffix(), "/default/default");
    }

    #[test]
    fn test_display_round_trips() {
        let id: ResourceId = LISTENER.parse().unwrap();
        assert_eq!(id.to_string(), LISTENER);
    }

    #[test]
    fn test_parent_and_root() {
        let id: ResourceId = LISTENER.parse().unwrap();
        let parent = id.parent().unwrap();
        assert_eq!(parent.leaf_name(), "default");
        assert_eq!(parent.children.len(), 1);
        assert!(id.root().parent().is_none());
        assert_eq!(id.resource_group_id(), "/subscriptions/sub1/resourceGroups/rg1");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<ResourceId>().is_err());
        assert!("/subscriptions/s/resourceGroups/g".parse::<ResourceId>().is_err());
        assert!("/subscriptions/s/resourceGroups/g/providers/ns/type/name/child"
            .parse::<ResourceId>()
            .is_err());
        assert!("/subs/s/resourceGroups/g/providers/ns/type/name"
            .parse::<ResourceId>()
            .is_err());
    }

    #[test]
    fn test_ids_match_ignores_case() {
        let id: ResourceId = LISTENER.parse().unwrap();
        assert!(id.matches(&LISTENER.to_uppercase()));
        assert!(ids_match("/a/B/", "/A/b"));
    }
}
