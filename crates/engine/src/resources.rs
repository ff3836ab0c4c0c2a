//! Resource binding application: resolve grants into dispatch parameters.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::model::DispatchRequest;
use crate::stores::{
    GrantQuery, GrantScope, PackageCatalog, ResourceGrant, ResourceGrantStore, ResourceProvider,
    ResourceRequirement,
};

/// Parameter key resource bindings are injected under.
pub const RESOURCE_BINDINGS_KEY: &str = "__resourceBindings";
/// Parameter key binding failures are appended to.
pub const RESOURCE_BINDING_ERRORS_KEY: &str = "__resourceBindingErrors";

/// Resource types whose values are inlined into the dispatch.
const INLINE_RESOURCE_TYPES: [&str; 6] =
    ["secret", "token", "api_key", "apikey", "key", "credential"];

fn should_inline(requirement: &ResourceRequirement) -> bool {
    let flagged = ["inline", "exposeValue"].iter().any(|key| {
        requirement.metadata.get(*key).and_then(Value::as_bool) == Some(true)
    });
    if flagged {
        return true;
    }
    let resource_type = requirement.resource_type.trim().to_ascii_lowercase();
    INLINE_RESOURCE_TYPES.contains(&resource_type.as_str())
}

fn newest_matching(grants: Vec<ResourceGrant>, package_version: &str) -> Option<ResourceGrant> {
    grants
        .into_iter()
        .filter(|grant| {
            grant
                .package_version
                .as_deref()
                .is_none_or(|version| version == package_version)
        })
        .max_by_key(|grant| grant.created_at)
}

/// Resolves package resource requirements into `__resourceBindings`
/// entries on outgoing dispatch requests.
///
/// Failures never block the dispatch; they are recorded under
/// `__resourceBindingErrors` so the worker can report a structured error.
pub struct ResourceBinder {
    catalog: Arc<dyn PackageCatalog>,
    grants: Arc<dyn ResourceGrantStore>,
    provider: Arc<dyn ResourceProvider>,
    max_inline_bytes: u64,
}

impl ResourceBinder {
    /// Create a binder over the given stores.
    pub fn new(
        catalog: Arc<dyn PackageCatalog>,
        grants: Arc<dyn ResourceGrantStore>,
        provider: Arc<dyn ResourceProvider>,
        max_inline_bytes: u64,
    ) -> Self {
        Self {
            catalog,
            grants,
            provider,
            max_inline_bytes,
        }
    }

    /// Apply bindings to a batch of requests. `workflow_ids` maps each
    /// request's run to its workflow for grant scoping.
    pub fn apply(&self, requests: &mut [DispatchRequest], workflow_ids: &HashMap<String, String>) {
        let mut requirements_cache: HashMap<(String, String), Vec<ResourceRequirement>> =
            HashMap::new();
        for request in requests {
            let Some(workflow_id) = workflow_ids.get(&request.run_id) else {
                continue;
            };
            let requirements = self.requirements_for(
                &request.package_name,
                &request.package_version,
                &mut requirements_cache,
            );
            if requirements.is_empty() {
                continue;
            }

            let mut bindings = Map::new();
            let mut errors: Vec<Value> = Vec::new();
            for requirement in &requirements {
                if requirement.key.is_empty() {
                    continue;
                }
                let Some(grant) = self.resolve_grant(
                    workflow_id,
                    &request.package_name,
                    &request.package_version,
                    &requirement.key,
                ) else {
                    if requirement.required {
                        errors.push(serde_json::json!({
                            "key": requirement.key,
                            "error": "missing_grant",
                        }));
                    }
                    continue;
                };
                if grant.resource_id.is_empty() {
                    continue;
                }
                let stored = match self.provider.describe(&grant.resource_id) {
                    Ok(stored) => stored,
                    Err(error) => {
                        tracing::debug!(
                            resource = %grant.resource_id,
                            %error,
                            "granted resource could not be described"
                        );
                        errors.push(serde_json::json!({
                            "key": requirement.key,
                            "error": "resource_not_found",
                            "resourceId": grant.resource_id,
                        }));
                        continue;
                    }
                };

                let mut binding = serde_json::json!({
                    "resourceId": stored.resource_id,
                    "type": stored.resource_type,
                    "filename": stored.filename,
                    "mimeType": stored.mime_type,
                    "sizeBytes": stored.size_bytes,
                    "metadata": Value::Object(stored.metadata.clone()),
                });
                if should_inline(requirement) {
                    match self.read_inline_value(&stored.resource_id, stored.size_bytes) {
                        Some(value) => {
                            binding["value"] = Value::String(value);
                        }
                        None => {
                            errors.push(serde_json::json!({
                                "key": requirement.key,
                                "error": "resource_value_unavailable",
                                "resourceId": stored.resource_id,
                            }));
                        }
                    }
                }
                bindings.insert(requirement.key.clone(), binding);
            }

            if bindings.is_empty() && errors.is_empty() {
                continue;
            }
            if !bindings.is_empty() {
                let merged = match request.parameters.get(RESOURCE_BINDINGS_KEY) {
                    Some(Value::Object(existing)) => {
                        let mut merged = existing.clone();
                        merged.extend(bindings);
                        merged
                    }
                    _ => bindings,
                };
                request
                    .parameters
                    .insert(RESOURCE_BINDINGS_KEY.into(), Value::Object(merged));
            }
            if !errors.is_empty() {
                request
                    .parameters
                    .insert(RESOURCE_BINDING_ERRORS_KEY.into(), Value::Array(errors));
            }
        }
    }

    fn requirements_for(
        &self,
        package_name: &str,
        package_version: &str,
        cache: &mut HashMap<(String, String), Vec<ResourceRequirement>>,
    ) -> Vec<ResourceRequirement> {
        if package_name.is_empty() || package_version.is_empty() {
            return Vec::new();
        }
        let key = (package_name.to_owned(), package_version.to_owned());
        if let Some(cached) = cache.get(&key) {
            return cached.clone();
        }
        let requirements = match self.catalog.manifest(package_name, package_version) {
            Ok(Some(manifest)) => manifest.resources,
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(package = %package_name, %error, "package manifest lookup failed");
                Vec::new()
            }
        };
        cache.insert(key, requirements.clone());
        requirements
    }

    fn resolve_grant(
        &self,
        workflow_id: &str,
        package_name: &str,
        package_version: &str,
        resource_key: &str,
    ) -> Option<ResourceGrant> {
        let workflow_grants = self.grants.list(&GrantQuery {
            workflow_id: Some(workflow_id),
            package_name,
            resource_key,
            scope: GrantScope::Workflow,
        });
        if let Some(grant) = newest_matching(workflow_grants, package_version) {
            return Some(grant);
        }
        let global_grants = self.grants.list(&GrantQuery {
            workflow_id: None,
            package_name,
            resource_key,
            scope: GrantScope::Global,
        });
        newest_matching(global_grants, package_version)
    }

    fn read_inline_value(&self, resource_id: &str, size_bytes: Option<u64>) -> Option<String> {
        if size_bytes.is_some_and(|size| size > self.max_inline_bytes) {
            return None;
        }
        let bytes = self.provider.read(resource_id).ok()?;
        if bytes.len() as u64 > self.max_inline_bytes {
            return None;
        }
        let text = String::from_utf8_lossy(&bytes).trim().to_owned();
        (!text.is_empty()).then_some(text)
    }
}
