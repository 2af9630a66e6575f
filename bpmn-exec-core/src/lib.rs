//! Execution core of a BPMN process-orchestration engine.
//!
//! Drives element instances through their lifecycle state machine and, at
//! the two listener checkpoints (activation and completion), suspends the
//! transition to run externally-fulfilled execution-listener jobs that may
//! read and mutate process variables before the native transition
//! proceeds. Jobs, incidents, and variable scopes round out the protocol:
//! recoverable failures loop through retry/backoff, unrecoverable ones
//! suspend exactly one element instance behind a resolvable incident, and
//! every state change lands on a totally ordered per-partition event log.
//!
//! Out of scope, consumed as collaborators: BPMN XML parsing and
//! deployment, the worker wire protocol, replication, exporters, and the
//! expression language itself (only its evaluation contract lives here).

pub mod definition;
pub mod engine;
pub mod events;
pub mod expression;
pub mod incidents;
pub mod jobs;
pub mod lifecycle;
pub mod listeners;
pub mod scope;
pub mod store;
pub mod store_memory;
pub mod types;

pub use definition::{
    ElementDescriptor, ExecutionListener, MultiInstance, ProcessDefinition,
    ProcessDefinitionBuilder,
};
pub use engine::ProcessEngine;
pub use events::EngineEvent;
pub use expression::{Expression, ExpressionEvaluator, LookupEvaluator};
pub use store::EngineStore;
pub use store_memory::MemoryStore;
pub use types::{
    ActivatedJob, BpmnElementType, ElementInstance, ElementLifecycleState, EngineError, EventKind,
    Incident, IncidentErrorType, Job, JobKind, JobState, Key, ListenerEventType, ProcessInstance,
    Rejection, RejectionType, Timestamp, VariableScope,
};
