use crate::definition::ProcessDefinition;
use crate::events::EngineEvent;
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence trait for all engine state on one partition.
///
/// The lifecycle controller, listener scheduler, job manager, and incident
/// manager operate exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests and embedded use, a durable store in
/// production).
#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Definitions ──

    async fn put_definition(&self, definition: ProcessDefinition) -> Result<()>;
    async fn definition_by_id(&self, process_id: &str) -> Result<Option<Arc<ProcessDefinition>>>;
    async fn definition_by_key(&self, key: Key) -> Result<Option<Arc<ProcessDefinition>>>;

    // ── Process instances ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;
    async fn load_instance(&self, key: Key) -> Result<Option<ProcessInstance>>;

    // ── Element instances ──

    async fn save_element(&self, element: &ElementInstance) -> Result<()>;
    async fn load_element(&self, key: Key) -> Result<Option<ElementInstance>>;
    /// Direct children of a flow scope, ordered by key.
    async fn children_of_scope(&self, flow_scope_key: Key) -> Result<Vec<ElementInstance>>;
    /// All element instances of one process instance, ordered by key.
    async fn elements_of_instance(&self, process_instance_key: Key)
        -> Result<Vec<ElementInstance>>;

    // ── Jobs ──

    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_job(&self, key: Key) -> Result<Option<Job>>;
    /// Jobs of the given type in state `Created`, ordered by key.
    async fn activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>>;

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> Result<()>;
    async fn load_incident(&self, key: Key) -> Result<Option<Incident>>;
    async fn open_incident_for_element(
        &self,
        element_instance_key: Key,
    ) -> Result<Option<Incident>>;

    // ── Variable scopes ──

    async fn save_scope(&self, scope: &VariableScope) -> Result<()>;
    async fn load_scope(&self, scope_key: Key) -> Result<Option<VariableScope>>;

    // ── Join barriers (parallel gateways) ──

    /// Increment the arrival count for a join within a scope instance.
    /// Returns the new count.
    async fn join_arrive(&self, scope_key: Key, gateway_id: &str) -> Result<u32>;
    async fn join_reset(&self, scope_key: Key, gateway_id: &str) -> Result<()>;

    // ── Backoff timers ──

    async fn schedule_backoff(&self, deadline_ms: Timestamp, job_key: Key) -> Result<()>;
    /// Remove and return timers due at `now_ms`, ordered by deadline.
    async fn take_due_backoffs(&self, now_ms: Timestamp) -> Result<Vec<(Timestamp, Key)>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, event: &EngineEvent) -> Result<u64>;
    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, EngineEvent)>>;
}

/// The definition a process instance was created from. Every component
/// resolves definitions through this.
pub(crate) async fn definition_for_instance(
    store: &dyn EngineStore,
    process_instance_key: Key,
) -> Result<Arc<ProcessDefinition>> {
    let instance = store
        .load_instance(process_instance_key)
        .await?
        .ok_or_else(|| anyhow!("unknown process instance {process_instance_key}"))?;
    store
        .definition_by_key(instance.definition_key)
        .await?
        .ok_or_else(|| anyhow!("missing definition {}", instance.definition_key))
}

/// Load an element instance or fail; callers hold keys they emitted.
pub(crate) async fn require_element(
    store: &dyn EngineStore,
    element_instance_key: Key,
) -> Result<ElementInstance> {
    store
        .load_element(element_instance_key)
        .await?
        .ok_or_else(|| anyhow!("unknown element instance {element_instance_key}"))
}
