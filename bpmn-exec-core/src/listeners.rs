use crate::events::EngineEvent;
use crate::expression::{self, snapshot_hash, ExpressionEvaluator};
use crate::incidents::IncidentManager;
use crate::jobs::JobManager;
use crate::scope::{self, MergeKind};
use crate::store::{definition_for_instance, require_element, EngineStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// What happened when the scheduler looked for the next listener at a
/// checkpoint.
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// A listener job was emitted; the transition suspends until a worker
    /// completes it.
    JobCreated(Key),
    /// Evaluation of the listener's type or retries failed; the chain is
    /// halted behind the incident until it is resolved.
    IncidentRaised(Key),
    /// No listener remains for this checkpoint; the native transition may
    /// proceed.
    Exhausted,
}

/// Schedules execution listeners strictly sequentially, in declaration
/// order, one checkpoint at a time. `listener_index` on the element
/// instance is the cursor; it only advances when a listener job reaches
/// COMPLETED.
pub struct ListenerScheduler {
    store: Arc<dyn EngineStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ListenerScheduler {
    pub fn new(store: Arc<dyn EngineStore>, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { store, evaluator }
    }

    /// Emit a job for the listener at the element's current
    /// `listener_index`, or report the chain exhausted. Type and retries
    /// are evaluated against the variables visible right now, including
    /// anything merged by earlier listeners of the same chain.
    pub async fn schedule_next(
        &self,
        jobs: &JobManager,
        incidents: &IncidentManager,
        element_instance_key: Key,
        checkpoint: ListenerEventType,
    ) -> Result<ScheduleOutcome> {
        let mut element = require_element(self.store.as_ref(), element_instance_key).await?;
        let definition =
            definition_for_instance(self.store.as_ref(), element.process_instance_key).await?;
        let descriptor = definition
            .descriptor(&element.element_id)
            .ok_or_else(|| anyhow!("unknown element '{}'", element.element_id))?;

        let listeners = descriptor.listeners_for(checkpoint);
        let index = element.listener_index as usize;
        let Some(listener) = listeners.get(index) else {
            return Ok(ScheduleOutcome::Exhausted);
        };

        let scope_key = scope::evaluation_scope(self.store.as_ref(), &element).await?;
        let snapshot = scope::collect_visible(self.store.as_ref(), scope_key).await?;

        let job_type =
            match expression::resolve_string(self.evaluator.as_ref(), &listener.job_type, &snapshot)
            {
                Ok(job_type) => job_type,
                Err(err) => {
                    let key = incidents
                        .raise(
                            IncidentErrorType::ExtractValueError,
                            err.message,
                            &element,
                            None,
                        )
                        .await?;
                    return Ok(ScheduleOutcome::IncidentRaised(key));
                }
            };
        let retries =
            match expression::resolve_retries(self.evaluator.as_ref(), &listener.retries, &snapshot)
            {
                Ok(retries) => retries,
                Err(err) => {
                    let key = incidents
                        .raise(
                            IncidentErrorType::ExtractValueError,
                            err.message,
                            &element,
                            None,
                        )
                        .await?;
                    return Ok(ScheduleOutcome::IncidentRaised(key));
                }
            };

        let job_key = jobs
            .create(
                JobKind::ExecutionListener,
                Some(checkpoint),
                &element,
                job_type,
                retries,
                Some(snapshot_hash(&snapshot)),
            )
            .await?;
        element.active_job_key = Some(job_key);
        self.store.save_element(&element).await?;
        debug!(
            element_id = %element.element_id,
            ?checkpoint,
            index,
            job_key,
            "execution listener scheduled"
        );
        Ok(ScheduleOutcome::JobCreated(job_key))
    }

    /// A listener job reached COMPLETED: merge its output into the scope
    /// owned by the declaring element and advance the chain cursor.
    pub async fn complete_listener(
        &self,
        job: &Job,
        document: &Map<String, Value>,
    ) -> Result<()> {
        let mut element = require_element(self.store.as_ref(), job.element_instance_key).await?;
        let event_type = job
            .listener_event_type
            .ok_or_else(|| anyhow!("job {} is not an execution-listener job", job.key))?;
        let merge_kind = match event_type {
            ListenerEventType::Start => MergeKind::Activation,
            ListenerEventType::End => MergeKind::Completion,
        };
        let target = scope::merge_target(self.store.as_ref(), &element, merge_kind).await?;
        scope::merge(self.store.as_ref(), target, document).await?;

        let completed_index = element.listener_index;
        element.listener_index += 1;
        element.active_job_key = None;
        self.store.save_element(&element).await?;
        self.store
            .append_event(&EngineEvent::ExecutionListenerCompleted {
                element_instance_key: element.key,
                process_instance_key: element.process_instance_key,
                element_id: element.element_id.clone(),
                event_type,
                listener_index: completed_index,
            })
            .await?;
        Ok(())
    }
}
