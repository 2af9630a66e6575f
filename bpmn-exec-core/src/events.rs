use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime events: the totally ordered, externally observable stream of
/// one partition. Element lifecycle transitions, job and incident state
/// changes, and variable facts all land here; exporters and operational
/// tooling consume nothing else.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessInstanceCreated {
        process_instance_key: Key,
        process_id: String,
    },
    ProcessInstanceCompleted {
        process_instance_key: Key,
    },
    ProcessInstanceCanceled {
        process_instance_key: Key,
    },
    /// One lifecycle step of one element instance.
    ElementTransitioned {
        element_instance_key: Key,
        process_instance_key: Key,
        element_id: String,
        element_type: BpmnElementType,
        state: ElementLifecycleState,
    },
    /// A listener job finished and the chain advanced; `listener_index` is
    /// the position the completed listener held in its chain.
    ExecutionListenerCompleted {
        element_instance_key: Key,
        process_instance_key: Key,
        element_id: String,
        event_type: ListenerEventType,
        listener_index: u32,
    },
    JobCreated {
        job_key: Key,
        kind: JobKind,
        listener_event_type: Option<ListenerEventType>,
        process_instance_key: Key,
        element_instance_key: Key,
        element_id: String,
        job_type: String,
        retries: u32,
        /// Hash of the scope snapshot the type/retries evaluation saw;
        /// lets replay verify evaluation inputs.
        scope_snapshot_hash: Option<[u8; 32]>,
    },
    JobCompleted {
        job_key: Key,
        job_type: String,
        kind: JobKind,
        variables: Value,
    },
    JobFailed {
        job_key: Key,
        job_type: String,
        retries: u32,
        backoff_ms: Option<u64>,
        error_message: Option<String>,
    },
    /// The job became activatable again under its original key, either
    /// after a backoff timer expired or after a no-retries incident was
    /// resolved with fresh retries.
    JobRecurred {
        job_key: Key,
        job_type: String,
    },
    JobRetriesUpdated {
        job_key: Key,
        retries: u32,
    },
    JobCanceled {
        job_key: Key,
        job_type: String,
        kind: JobKind,
        listener_event_type: Option<ListenerEventType>,
    },
    IncidentCreated {
        incident_key: Key,
        error_type: IncidentErrorType,
        error_message: String,
        process_instance_key: Key,
        element_instance_key: Key,
        job_key: Option<Key>,
    },
    IncidentResolved {
        incident_key: Key,
        element_instance_key: Key,
    },
    VariableCreated {
        scope_key: Key,
        process_instance_key: Key,
        name: String,
        value: Value,
    },
    VariableUpdated {
        scope_key: Key,
        process_instance_key: Key,
        name: String,
        value: Value,
    },
}

impl EngineEvent {
    pub(crate) fn element_transition(
        element: &ElementInstance,
        state: ElementLifecycleState,
    ) -> Self {
        EngineEvent::ElementTransitioned {
            element_instance_key: element.key,
            process_instance_key: element.process_instance_key,
            element_id: element.element_id.clone(),
            element_type: element.element_type,
            state,
        }
    }
}
