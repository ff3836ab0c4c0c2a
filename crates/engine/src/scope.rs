//! Alias/subgraph scope index for resolving scoped port bindings.

use std::collections::{HashMap, HashSet};

use lattice_core::workflow::{PortBinding, WorkflowDefinition};
use serde::{Deserialize, Serialize};

/// Parsed scope qualifier of a port binding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingScopeHint {
    /// Scope kind (`subgraph` or `local`).
    pub kind: Option<String>,
    /// Alias chain the binding is scoped to.
    pub subgraph_aliases: Vec<String>,
    /// Explicit node override.
    pub node_id: Option<String>,
}

/// Parse an inline scope prefix: `@alias.inner.#node` or `#node`.
#[must_use]
pub fn parse_scope_prefix(prefix: &str) -> Option<BindingScopeHint> {
    let text = prefix.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(rest) = text.strip_prefix('@') {
        let mut node_id = None;
        let mut aliases = Vec::new();
        for token in rest.split('.').filter(|token| !token.is_empty()) {
            if let Some(node) = token.strip_prefix('#') {
                if !node.is_empty() {
                    node_id = Some(node.to_owned());
                }
            } else {
                aliases.push(token.to_owned());
            }
        }
        if aliases.is_empty() {
            return None;
        }
        return Some(BindingScopeHint {
            kind: Some("subgraph".into()),
            subgraph_aliases: aliases,
            node_id,
        });
    }
    if let Some(node) = text.strip_prefix('#') {
        return Some(BindingScopeHint {
            kind: Some("local".into()),
            subgraph_aliases: Vec::new(),
            node_id: (!node.is_empty()).then(|| node.to_owned()),
        });
    }
    None
}

/// Extract the scope hint from a port binding, preferring the structured
/// scope over the inline prefix.
#[must_use]
pub fn scope_hint_from_binding(binding: &PortBinding) -> Option<BindingScopeHint> {
    if let Some(scope) = &binding.scope {
        let mut aliases = scope.subgraph_aliases.clone();
        // Back-compat: legacy payloads may still carry workflow_alias.
        if let Some(workflow_alias) = &scope.workflow_alias
            && !aliases.contains(workflow_alias)
        {
            aliases.insert(0, workflow_alias.clone());
        }
        return Some(BindingScopeHint {
            kind: scope.kind.clone(),
            subgraph_aliases: aliases,
            node_id: scope.node_id.clone(),
        });
    }
    binding.prefix.as_deref().and_then(parse_scope_prefix)
}

/// Alias/subgraph metadata for resolving scoped bindings within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowScopeIndex {
    node_ids: HashSet<String>,
    alias_paths: HashMap<String, Vec<String>>,
    node_memberships: HashMap<String, Vec<Vec<String>>>,
}

impl WorkflowScopeIndex {
    /// Build the index for a workflow definition.
    #[must_use]
    pub fn new(workflow: &WorkflowDefinition) -> Self {
        let node_ids: HashSet<String> =
            workflow.nodes.iter().map(|node| node.id.clone()).collect();

        let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
        for subgraph in &workflow.subgraphs {
            parents.insert(subgraph.effective_alias(), subgraph.effective_parent_alias());
        }

        let mut alias_paths: HashMap<String, Vec<String>> = HashMap::new();
        for subgraph in &workflow.subgraphs {
            let alias = subgraph.effective_alias();
            let mut chain = Vec::new();
            let mut visited = HashSet::new();
            let mut current = Some(alias);
            while let Some(alias) = current {
                if !visited.insert(alias) {
                    break;
                }
                chain.insert(0, alias.to_owned());
                current = parents.get(alias).copied().flatten();
            }
            if !chain.is_empty() {
                alias_paths.insert(alias.to_owned(), chain);
            }
        }

        let mut node_memberships: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for subgraph in &workflow.subgraphs {
            let Some(chain) = alias_paths.get(subgraph.effective_alias()) else {
                continue;
            };
            let Some(definition) = &subgraph.definition else {
                continue;
            };
            for node in &definition.nodes {
                if !node_ids.contains(&node.id) {
                    continue;
                }
                let memberships = node_memberships.entry(node.id.clone()).or_default();
                if !memberships.contains(chain) {
                    memberships.push(chain.clone());
                }
            }
        }

        Self {
            node_ids,
            alias_paths,
            node_memberships,
        }
    }

    /// Resolve the node a binding refers to, honouring the scope hint.
    ///
    /// Returns `None` when the hint names a node outside the hinted scope or
    /// a node the workflow does not contain.
    #[must_use]
    pub fn resolve_node(
        &self,
        hint: Option<&BindingScopeHint>,
        fallback_node: Option<&str>,
    ) -> Option<String> {
        let node_id = hint
            .and_then(|hint| hint.node_id.as_deref())
            .or(fallback_node)?;
        if !self.node_ids.contains(node_id) {
            return None;
        }
        let Some(hint) = hint else {
            return Some(node_id.to_owned());
        };
        if hint.subgraph_aliases.is_empty() {
            return Some(node_id.to_owned());
        }
        if self.node_matches_alias_chain(node_id, &hint.subgraph_aliases) {
            Some(node_id.to_owned())
        } else {
            None
        }
    }

    fn node_matches_alias_chain(&self, node_id: &str, alias_chain: &[String]) -> bool {
        let Some(memberships) = self.node_memberships.get(node_id) else {
            return false;
        };
        memberships.iter().any(|membership| {
            membership.len() >= alias_chain.len()
                && membership[membership.len() - alias_chain.len()..] == *alias_chain
        })
    }
}
