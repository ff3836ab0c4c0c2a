//! Repository traits for external stores, with in-memory implementations.
//!
//! The engine persists nothing itself; workflow definitions, package
//! manifests and resource blobs live behind these seams.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lattice_core::WorkflowDefinition;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors from package catalog access.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog backend failed.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Errors from resource access.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The resource exists but could not be read.
    #[error("resource unreadable: {0}")]
    Unreadable(String),
}

/// A resource requirement declared in a package manifest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    /// Requirement key, referenced by grants.
    pub key: String,
    /// Resource type (`secret`, `file`, ...).
    #[serde(rename = "type", default)]
    pub resource_type: String,
    /// Whether a missing grant is an error.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Free-form metadata (`inline`/`exposeValue` force value inlining).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// A package manifest, reduced to what dispatch needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Declared resource requirements.
    #[serde(default)]
    pub resources: Vec<ResourceRequirement>,
}

/// Catalog of published package manifests.
pub trait PackageCatalog: Send + Sync {
    /// Fetch a manifest, `None` when unknown.
    fn manifest(&self, name: &str, version: &str) -> Result<Option<PackageManifest>, CatalogError>;
}

/// Scope a grant was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    /// Bound to one workflow.
    Workflow,
    /// Usable by any workflow of the tenant.
    Global,
}

/// Query parameters for grant listing.
#[derive(Debug, Clone)]
pub struct GrantQuery<'a> {
    /// Workflow the lookup is scoped to, for workflow-scope queries.
    pub workflow_id: Option<&'a str>,
    /// Package the grant authorises.
    pub package_name: &'a str,
    /// Requirement key the grant satisfies.
    pub resource_key: &'a str,
    /// Scope to search.
    pub scope: GrantScope,
}

/// A resource authorisation bound to `(package, resourceKey, scope)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrant {
    /// The granted resource.
    pub resource_id: String,
    /// Package the grant authorises.
    pub package_name: String,
    /// Specific package version, or any when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    /// Requirement key the grant satisfies.
    pub resource_key: String,
    /// Grant scope.
    pub scope: GrantScope,
    /// Workflow binding, for workflow-scope grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Issue time; newest wins on conflicts.
    pub created_at: DateTime<Utc>,
}

/// Store of resource grants.
pub trait ResourceGrantStore: Send + Sync {
    /// List grants matching the query.
    fn list(&self, query: &GrantQuery<'_>) -> Vec<ResourceGrant>;
}

/// Metadata of a stored resource blob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResource {
    /// Resource id.
    pub resource_id: String,
    /// Resource type.
    #[serde(rename = "type", default)]
    pub resource_type: String,
    /// Original filename, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Access to resource blobs.
pub trait ResourceProvider: Send + Sync {
    /// Fetch resource metadata.
    fn describe(&self, resource_id: &str) -> Result<StoredResource, ResourceError>;
    /// Read the resource bytes.
    fn read(&self, resource_id: &str) -> Result<Vec<u8>, ResourceError>;
}

/// Store of workflow definitions.
pub trait WorkflowStore: Send + Sync {
    /// Fetch a definition by id.
    fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition>;
    /// Store a definition.
    fn put(&self, workflow: WorkflowDefinition);
}

/// In-memory [`PackageCatalog`].
#[derive(Default)]
pub struct InMemoryCatalog {
    manifests: RwLock<HashMap<(String, String), PackageManifest>>,
}

impl InMemoryCatalog {
    /// Register a manifest.
    pub fn insert(&self, manifest: PackageManifest) {
        self.manifests
            .write()
            .insert((manifest.name.clone(), manifest.version.clone()), manifest);
    }
}

impl PackageCatalog for InMemoryCatalog {
    fn manifest(&self, name: &str, version: &str) -> Result<Option<PackageManifest>, CatalogError> {
        Ok(self
            .manifests
            .read()
            .get(&(name.to_owned(), version.to_owned()))
            .cloned())
    }
}

/// In-memory [`ResourceGrantStore`].
#[derive(Default)]
pub struct InMemoryGrantStore {
    grants: RwLock<Vec<ResourceGrant>>,
}

impl InMemoryGrantStore {
    /// Register a grant.
    pub fn insert(&self, grant: ResourceGrant) {
        self.grants.write().push(grant);
    }
}

impl ResourceGrantStore for InMemoryGrantStore {
    fn list(&self, query: &GrantQuery<'_>) -> Vec<ResourceGrant> {
        self.grants
            .read()
            .iter()
            .filter(|grant| {
                grant.scope == query.scope
                    && grant.package_name == query.package_name
                    && grant.resource_key == query.resource_key
                    && (query.scope == GrantScope::Global
                        || grant.workflow_id.as_deref() == query.workflow_id)
            })
            .cloned()
            .collect()
    }
}

/// In-memory [`ResourceProvider`].
#[derive(Default)]
pub struct InMemoryResourceProvider {
    resources: RwLock<HashMap<String, (StoredResource, Vec<u8>)>>,
}

impl InMemoryResourceProvider {
    /// Register a resource with its bytes.
    pub fn insert(&self, resource: StoredResource, bytes: Vec<u8>) {
        self.resources
            .write()
            .insert(resource.resource_id.clone(), (resource, bytes));
    }
}

impl ResourceProvider for InMemoryResourceProvider {
    fn describe(&self, resource_id: &str) -> Result<StoredResource, ResourceError> {
        self.resources
            .read()
            .get(resource_id)
            .map(|(resource, _)| resource.clone())
            .ok_or_else(|| ResourceError::NotFound(resource_id.to_owned()))
    }

    fn read(&self, resource_id: &str) -> Result<Vec<u8>, ResourceError> {
        self.resources
            .read()
            .get(resource_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ResourceError::NotFound(resource_id.to_owned()))
    }
}

/// In-memory [`WorkflowStore`].
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().get(workflow_id).cloned()
    }

    fn put(&self, workflow: WorkflowDefinition) {
        self.workflows.write().insert(workflow.id.clone(), workflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn catalog_roundtrip() {
        let catalog = InMemoryCatalog::default();
        catalog.insert(PackageManifest {
            name: "pkg".into(),
            version: "1.0.0".into(),
            resources: vec![ResourceRequirement {
                key: "api_key".into(),
                resource_type: "secret".into(),
                required: true,
                metadata: Map::new(),
            }],
        });
        let manifest = catalog.manifest("pkg", "1.0.0").unwrap().unwrap();
        assert_eq!(manifest.resources.len(), 1);
        assert!(catalog.manifest("pkg", "2.0.0").unwrap().is_none());
    }

    #[test]
    fn grant_store_filters_scope_and_workflow() {
        let store = InMemoryGrantStore::default();
        store.insert(ResourceGrant {
            resource_id: "res-1".into(),
            package_name: "pkg".into(),
            package_version: None,
            resource_key: "api_key".into(),
            scope: GrantScope::Workflow,
            workflow_id: Some("wf-1".into()),
            created_at: Utc::now(),
        });
        store.insert(ResourceGrant {
            resource_id: "res-2".into(),
            package_name: "pkg".into(),
            package_version: None,
            resource_key: "api_key".into(),
            scope: GrantScope::Global,
            workflow_id: None,
            created_at: Utc::now(),
        });

        let workflow_hits = store.list(&GrantQuery {
            workflow_id: Some("wf-1"),
            package_name: "pkg",
            resource_key: "api_key",
            scope: GrantScope::Workflow,
        });
        assert_eq!(workflow_hits.len(), 1);
        assert_eq!(workflow_hits[0].resource_id, "res-1");

        let other_workflow = store.list(&GrantQuery {
            workflow_id: Some("wf-2"),
            package_name: "pkg",
            resource_key: "api_key",
            scope: GrantScope::Workflow,
        });
        assert!(other_workflow.is_empty());

        let global_hits = store.list(&GrantQuery {
            workflow_id: None,
            package_name: "pkg",
            resource_key: "api_key",
            scope: GrantScope::Global,
        });
        assert_eq!(global_hits[0].resource_id, "res-2");
    }

    #[test]
    fn resource_provider_reads_bytes() {
        let provider = InMemoryResourceProvider::default();
        provider.insert(
            StoredResource {
                resource_id: "res-1".into(),
                resource_type: "secret".into(),
                size_bytes: Some(5),
                ..StoredResource::default()
            },
            b"token".to_vec(),
        );
        assert_eq!(provider.read("res-1").unwrap(), b"token");
        assert!(matches!(
            provider.read("missing"),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[test]
    fn requirement_defaults_required() {
        let requirement: ResourceRequirement =
            serde_json::from_value(serde_json::json!({"key": "k"})).unwrap();
        assert!(requirement.required);
    }
}
