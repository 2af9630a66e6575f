use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// ─── Scalar aliases ───────────────────────────────────────────

/// Record key. Every instance, job, incident, and definition is addressed
/// by one of these; the partition id lives in the high bits.
pub type Key = u64;

/// Epoch milliseconds on the engine's logical clock.
pub type Timestamp = i64;

/// How many bits of a key are left for the per-partition counter.
const KEY_PARTITION_SHIFT: u32 = 51;

/// Generates partition-prefixed keys. Strictly monotonic within a
/// partition, so record order is recoverable from keys alone.
#[derive(Debug)]
pub struct KeyGenerator {
    partition_id: u32,
    counter: AtomicU64,
}

impl KeyGenerator {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_key(&self) -> Key {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        ((self.partition_id as u64) << KEY_PARTITION_SHIFT) | n
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }
}

// ─── Element taxonomy ─────────────────────────────────────────

/// Closed set of BPMN element kinds known to the execution core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BpmnElementType {
    Process,
    SubProcess,
    EventSubProcess,
    ServiceTask,
    UserTask,
    ScriptTask,
    BusinessRuleTask,
    SendTask,
    ReceiveTask,
    ManualTask,
    Task,
    StartEvent,
    EndEvent,
    ExclusiveGateway,
    ParallelGateway,
    BoundaryEvent,
    /// Synthetic wrapper instance around a multi-instance activity. One
    /// body owns N iteration instances of the underlying element type.
    MultiInstanceBody,
}

/// Refinement of event elements; consulted by the listener capability
/// table (error/compensation events reject end listeners).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    None,
    Message,
    Timer,
    Error,
    Compensation,
}

impl BpmnElementType {
    /// Whether instances of this type own a variable scope. Multi-instance
    /// iterations also own one; that is an instance-level property, see
    /// [`ElementInstance::owns_scope`].
    pub fn introduces_scope(&self) -> bool {
        matches!(
            self,
            BpmnElementType::Process | BpmnElementType::SubProcess | BpmnElementType::EventSubProcess
        )
    }

    /// Capability table for execution listeners. Structural: the builder
    /// rejects violations at definition time and the lifecycle controller
    /// refuses to schedule unsupported phases at runtime.
    pub fn supports_listeners(&self, event_type: ListenerEventType, kind: EventKind) -> bool {
        match self {
            // Start events and boundary events activate on an external
            // trigger; nothing may run before that trigger.
            BpmnElementType::StartEvent => event_type == ListenerEventType::End,
            BpmnElementType::BoundaryEvent => {
                event_type == ListenerEventType::End && kind != EventKind::Compensation
            }
            BpmnElementType::EndEvent => {
                event_type == ListenerEventType::Start
                    || !matches!(kind, EventKind::Error | EventKind::Compensation)
            }
            // Gateways complete within a single processing step; there is
            // no observable point after their native completion.
            BpmnElementType::ExclusiveGateway | BpmnElementType::ParallelGateway => {
                event_type == ListenerEventType::Start
            }
            // The body delegates to its iteration instances.
            BpmnElementType::MultiInstanceBody => false,
            _ => true,
        }
    }

    pub fn supports_io_mappings(&self) -> bool {
        !matches!(
            self,
            BpmnElementType::Task
                | BpmnElementType::ManualTask
                | BpmnElementType::ExclusiveGateway
                | BpmnElementType::ParallelGateway
                | BpmnElementType::MultiInstanceBody
        )
    }

    /// Types whose native behavior is fulfilled by an external job worker.
    pub fn is_job_worker_task(&self) -> bool {
        matches!(
            self,
            BpmnElementType::ServiceTask
                | BpmnElementType::UserTask
                | BpmnElementType::ScriptTask
                | BpmnElementType::BusinessRuleTask
                | BpmnElementType::SendTask
        )
    }
}

// ─── Element lifecycle ────────────────────────────────────────

/// Lifecycle of one element instance. `Activating` and `Completing` are the
/// two listener checkpoints; the `Activated`/`Completed` states are only
/// reached once the checkpoint's listener chain is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementLifecycleState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl ElementLifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElementLifecycleState::Completed | ElementLifecycleState::Terminated
        )
    }

    /// Stable tag for structured logging and test traces.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementLifecycleState::Activating => "activating",
            ElementLifecycleState::Activated => "activated",
            ElementLifecycleState::Completing => "completing",
            ElementLifecycleState::Completed => "completed",
            ElementLifecycleState::Terminating => "terminating",
            ElementLifecycleState::Terminated => "terminated",
        }
    }
}

/// The two listener checkpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerEventType {
    Start,
    End,
}

/// One activation of one BPMN element within one process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub element_type: BpmnElementType,
    pub state: ElementLifecycleState,
    /// Owning parent element instance; `None` for the process root.
    pub flow_scope_key: Option<Key>,
    /// Position within the listener chain of the current checkpoint.
    pub listener_index: u32,
    pub active_job_key: Option<Key>,
    /// Set on multi-instance iteration instances: the collection item this
    /// iteration was spawned for.
    pub multi_instance_item: Option<serde_json::Value>,
}

impl ElementInstance {
    pub fn owns_scope(&self) -> bool {
        self.element_type.introduces_scope() || self.multi_instance_item.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessInstanceState {
    Active,
    Completed,
    Canceled,
}

impl ProcessInstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessInstanceState::Active)
    }
}

/// Top-level instance record. Its key doubles as the root element
/// instance key and the root variable scope key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub key: Key,
    pub process_id: String,
    pub definition_key: Key,
    pub state: ProcessInstanceState,
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Distinguishes ordinary element jobs from execution-listener jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Task,
    ExecutionListener,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Failed,
    Completed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Canceled)
    }
}

/// A unit of externally-fulfilled work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub key: Key,
    pub kind: JobKind,
    /// Which checkpoint this job belongs to; only for listener jobs.
    pub listener_event_type: Option<ListenerEventType>,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub element_id: String,
    pub job_type: String,
    pub retries: u32,
    pub state: JobState,
    /// Deadline of a pending backoff timer, if the job failed with one.
    pub backoff_deadline_ms: Option<Timestamp>,
    /// Last completion payload supplied by a worker.
    pub variables: serde_json::Value,
    pub error_message: Option<String>,
}

/// Worker-facing view of an activatable job, with the variables visible
/// at the owning element at activation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivatedJob {
    pub key: Key,
    pub kind: JobKind,
    pub listener_event_type: Option<ListenerEventType>,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub element_id: String,
    pub job_type: String,
    pub retries: u32,
    pub variables: BTreeMap<String, serde_json::Value>,
}

// ─── Incidents ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentErrorType {
    /// Expression evaluation failed (listener type/retries, job type,
    /// multi-instance collection).
    ExtractValueError,
    /// Input or output variable mapping failed.
    IoMappingError,
    /// An execution-listener job ran out of retries.
    ExecutionListenerNoRetries,
    /// An ordinary task job ran out of retries.
    JobNoRetries,
    /// A task job threw a business error that nothing catches.
    UnhandledErrorEvent,
}

/// A suspended-error record. At most one open incident exists per element
/// instance; resolving it re-attempts exactly the failed operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub key: Key,
    pub error_type: IncidentErrorType,
    pub error_message: String,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub job_key: Option<Key>,
    pub resolved: bool,
}

// ─── Variable scopes ──────────────────────────────────────────

/// Hierarchical key/value store. One record per scope-introducing element
/// instance (process root, sub-process, multi-instance iteration); the
/// scope key is the owning element instance key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableScope {
    pub scope_key: Key,
    pub parent: Option<Key>,
    pub process_instance_key: Key,
    pub variables: BTreeMap<String, serde_json::Value>,
}

// ─── Command rejections ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionType {
    NotFound,
    InvalidState,
    InvalidArgument,
}

/// Synchronous refusal of a structurally invalid command. Rejections are
/// reported to the caller and never mutate state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{rejection_type:?}: {reason}")]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            rejection_type: RejectionType::NotFound,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self {
            rejection_type: RejectionType::InvalidState,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self {
            rejection_type: RejectionType::InvalidArgument,
            reason: reason.into(),
        }
    }
}

/// Engine-surface error: either a command rejection or an internal
/// store/consistency failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejection(#[from] Rejection),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// The rejection, if this error is one. Lets callers assert rejection
    /// types without string matching.
    pub fn as_rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejection(r) => Some(r),
            EngineError::Internal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_partition_prefixed_and_monotonic() {
        let keys = KeyGenerator::new(3);
        let a = keys.next_key();
        let b = keys.next_key();
        assert!(b > a);
        assert_eq!(a >> 51, 3);
        assert_eq!(b >> 51, 3);
    }

    #[test]
    fn start_events_reject_start_listeners() {
        assert!(!BpmnElementType::StartEvent
            .supports_listeners(ListenerEventType::Start, EventKind::None));
        assert!(BpmnElementType::StartEvent
            .supports_listeners(ListenerEventType::End, EventKind::None));
    }

    #[test]
    fn gateways_reject_end_listeners() {
        for gw in [
            BpmnElementType::ExclusiveGateway,
            BpmnElementType::ParallelGateway,
        ] {
            assert!(gw.supports_listeners(ListenerEventType::Start, EventKind::None));
            assert!(!gw.supports_listeners(ListenerEventType::End, EventKind::None));
        }
    }

    #[test]
    fn error_and_compensation_end_events_reject_end_listeners() {
        for kind in [EventKind::Error, EventKind::Compensation] {
            assert!(!BpmnElementType::EndEvent.supports_listeners(ListenerEventType::End, kind));
        }
        assert!(
            BpmnElementType::EndEvent.supports_listeners(ListenerEventType::End, EventKind::None)
        );
    }

    #[test]
    fn boundary_events_only_support_end_listeners_outside_compensation() {
        let boundary = BpmnElementType::BoundaryEvent;
        assert!(!boundary.supports_listeners(ListenerEventType::Start, EventKind::Message));
        assert!(boundary.supports_listeners(ListenerEventType::End, EventKind::Message));
        assert!(!boundary.supports_listeners(ListenerEventType::End, EventKind::Compensation));
    }

    #[test]
    fn multi_instance_iterations_own_a_scope() {
        let iteration = ElementInstance {
            key: 1,
            process_instance_key: 1,
            element_id: "task".into(),
            element_type: BpmnElementType::ServiceTask,
            state: ElementLifecycleState::Activating,
            flow_scope_key: Some(1),
            listener_index: 0,
            active_job_key: None,
            multi_instance_item: Some(serde_json::json!("item")),
        };
        assert!(iteration.owns_scope());
    }
}
