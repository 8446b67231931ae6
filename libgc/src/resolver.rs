use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::error::ResolveError;

/// A concrete resource collection in the store, e.g. `v1` `pods` or
/// `apps/v1` `replicasets`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group_version: String,
    pub resource: String,
}

impl ResourceType {
    pub fn new(group_version: &str, resource: &str) -> Self {
        ResourceType {
            group_version: group_version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// The API group, empty for the core group.
    pub fn group(&self) -> &str {
        match self.group_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_version, self.resource)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceMapping {
    pub resource: ResourceType,
    pub kind: String,
    pub namespaced: bool,
}

/// Maps (apiVersion, kind) to the resource that stores it.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceMapping, ResolveError>;

    /// Every resource known to the resolver; the collector monitors these.
    fn resources(&self) -> Vec<ResourceMapping>;
}

/// One entry of the `resources` list in the collector config.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    pub api_version: String,
    pub kind: String,
    pub resource: String,
    #[serde(default = "default_namespaced")]
    pub namespaced: bool,
}

fn default_namespaced() -> bool {
    true
}

/// Fixed table resolver, seeded with the built-in kinds.
#[derive(Default)]
pub struct StaticResolver {
    mappings: HashMap<(String, String), ResourceMapping>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        for (api_version, kind, resource, namespaced) in [
            ("v1", "Pod", "pods", true),
            ("v1", "ReplicationController", "replicationcontrollers", true),
            ("v1", "Service", "services", true),
            ("v1", "ConfigMap", "configmaps", true),
            ("v1", "Secret", "secrets", true),
            ("v1", "Node", "nodes", false),
            ("v1", "Namespace", "namespaces", false),
            ("apps/v1", "ReplicaSet", "replicasets", true),
            ("apps/v1", "Deployment", "deployments", true),
            ("apps/v1", "DaemonSet", "daemonsets", true),
            ("apps/v1", "StatefulSet", "statefulsets", true),
            ("batch/v1", "Job", "jobs", true),
        ] {
            resolver.register(api_version, kind, resource, namespaced);
        }
        resolver
    }

    pub fn register(&mut self, api_version: &str, kind: &str, resource: &str, namespaced: bool) {
        self.mappings.insert(
            (api_version.to_string(), kind.to_string()),
            ResourceMapping {
                resource: ResourceType::new(api_version, resource),
                kind: kind.to_string(),
                namespaced,
            },
        );
    }

    pub fn register_entries(&mut self, entries: &[ResourceEntry]) {
        for e in entries {
            self.register(&e.api_version, &e.kind, &e.resource, e.namespaced);
        }
    }
}

impl ResourceResolver for StaticResolver {
    fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceMapping, ResolveError> {
        self.mappings
            .get(&(api_version.to_string(), kind.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::UnknownKind {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            })
    }

    fn resources(&self) -> Vec<ResourceMapping> {
        let mut res: Vec<_> = self.mappings.values().cloned().collect();
        res.sort_by(|a, b| a.resource.to_string().cmp(&b.resource.to_string()));
        res
    }
}
