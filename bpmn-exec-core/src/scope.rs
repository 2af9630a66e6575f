use crate::definition::VariableMapping;
use crate::events::EngineEvent;
use crate::expression::{self, EvaluationError, Expression, ExpressionEvaluator, ScopeSnapshot};
use crate::store::{require_element, EngineStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Where a variable document is headed, which decides the scope it merges
/// into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergeKind {
    /// Start-listener output and input-mapping results: land in the
    /// element's own scope when it introduces one, else in the nearest
    /// ancestor scope.
    Activation,
    /// End-listener output, task completion payloads, and output-mapping
    /// results: land in the scope that survives the element's completion,
    /// the flow scope, except at isolation boundaries (process root,
    /// multi-instance iteration), which absorb their own output.
    Completion,
}

/// Nearest scope-owning element instance at or above `start`.
pub(crate) async fn nearest_scope(store: &dyn EngineStore, start: Key) -> Result<Key> {
    let mut current = Some(start);
    while let Some(key) = current {
        let element = require_element(store, key).await?;
        if element.owns_scope() {
            return Ok(key);
        }
        current = element.flow_scope_key;
    }
    Err(anyhow!("element {start} has no owning scope"))
}

/// The scope a document produced at `element` merges into.
pub(crate) async fn merge_target(
    store: &dyn EngineStore,
    element: &ElementInstance,
    kind: MergeKind,
) -> Result<Key> {
    let own = element.owns_scope();
    let isolation_boundary = element.flow_scope_key.is_none() || element.multi_instance_item.is_some();
    match kind {
        MergeKind::Activation if own => Ok(element.key),
        MergeKind::Completion if own && isolation_boundary => Ok(element.key),
        _ => match element.flow_scope_key {
            Some(parent) => nearest_scope(store, parent).await,
            None => Ok(element.key),
        },
    }
}

/// The scope chain evaluations and job activations read from at `element`.
pub(crate) async fn evaluation_scope(
    store: &dyn EngineStore,
    element: &ElementInstance,
) -> Result<Key> {
    if element.owns_scope() {
        Ok(element.key)
    } else {
        nearest_scope(
            store,
            element
                .flow_scope_key
                .ok_or_else(|| anyhow!("element {} has no flow scope", element.key))?,
        )
        .await
    }
}

/// Flatten the scope chain into a snapshot; inner scopes shadow outer ones.
pub(crate) async fn collect_visible(
    store: &dyn EngineStore,
    scope_key: Key,
) -> Result<ScopeSnapshot> {
    let mut chain = Vec::new();
    let mut current = Some(scope_key);
    while let Some(key) = current {
        let scope = store
            .load_scope(key)
            .await?
            .ok_or_else(|| anyhow!("unknown variable scope {key}"))?;
        current = scope.parent;
        chain.push(scope);
    }
    let mut snapshot = ScopeSnapshot::new();
    for scope in chain.into_iter().rev() {
        snapshot.extend(scope.variables.into_iter());
    }
    Ok(snapshot)
}

/// Write each entry of `document` into the scope, emitting a created or
/// updated fact per key. The distinction is observable and preserved.
pub(crate) async fn merge(
    store: &dyn EngineStore,
    scope_key: Key,
    document: &Map<String, Value>,
) -> Result<()> {
    if document.is_empty() {
        return Ok(());
    }
    let mut scope = store
        .load_scope(scope_key)
        .await?
        .ok_or_else(|| anyhow!("unknown variable scope {scope_key}"))?;
    for (name, value) in document {
        let existed = scope
            .variables
            .insert(name.clone(), value.clone())
            .is_some();
        let event = if existed {
            EngineEvent::VariableUpdated {
                scope_key,
                process_instance_key: scope.process_instance_key,
                name: name.clone(),
                value: value.clone(),
            }
        } else {
            EngineEvent::VariableCreated {
                scope_key,
                process_instance_key: scope.process_instance_key,
                name: name.clone(),
                value: value.clone(),
            }
        };
        store.append_event(&event).await?;
    }
    debug!(scope_key, count = document.len(), "merged variables");
    store.save_scope(&scope).await?;
    Ok(())
}

/// Interpret a worker payload: must be a JSON object or null.
pub(crate) fn payload_document(payload: &Value) -> Result<Map<String, Value>, Rejection> {
    match payload {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(Rejection::invalid_argument(format!(
            "Expected a variables document of type 'OBJECT', but was '{}'",
            expression::value_type_name(other)
        ))),
    }
}

/// Evaluate a mapping list against a snapshot. All-or-nothing: the first
/// failing mapping aborts the batch so a retry sees unchanged state.
pub(crate) fn evaluate_mappings(
    evaluator: &dyn ExpressionEvaluator,
    mappings: &[VariableMapping],
    snapshot: &ScopeSnapshot,
) -> Result<Map<String, Value>, EvaluationError> {
    let mut document = Map::new();
    for mapping in mappings {
        let value = expression::resolve(evaluator, &mapping.source, snapshot)?;
        if value.is_null() {
            if let Expression::Expr(source) = &mapping.source {
                return Err(EvaluationError {
                    expression: source.clone(),
                    message: format!("No variable found with name '{source}'"),
                });
            }
        }
        document.insert(mapping.target.clone(), value);
    }
    Ok(document)
}
