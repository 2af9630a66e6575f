use crate::events::EngineEvent;
use crate::incidents::IncidentManager;
use crate::scope::{self, payload_document};
use crate::store::{require_element, EngineStore};
use crate::types::*;
use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Owns job state (creation, worker actions, retry/backoff recurrence,
/// cancellation) independent of job kind. The interplay with listener
/// chains and element transitions stays with the scheduler and the
/// lifecycle controller.
pub struct JobManager {
    store: Arc<dyn EngineStore>,
    keys: Arc<KeyGenerator>,
}

fn kind_label(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Task => "TASK",
        JobKind::ExecutionListener => "EXECUTION_LISTENER",
    }
}

impl JobManager {
    pub fn new(store: Arc<dyn EngineStore>, keys: Arc<KeyGenerator>) -> Self {
        Self { store, keys }
    }

    /// Create a job for an element instance and journal it, together with
    /// the hash of the scope snapshot its type/retries evaluation saw.
    pub(crate) async fn create(
        &self,
        kind: JobKind,
        listener_event_type: Option<ListenerEventType>,
        element: &ElementInstance,
        job_type: String,
        retries: u32,
        scope_snapshot_hash: Option<[u8; 32]>,
    ) -> Result<Key> {
        let job = Job {
            key: self.keys.next_key(),
            kind,
            listener_event_type,
            process_instance_key: element.process_instance_key,
            element_instance_key: element.key,
            element_id: element.element_id.clone(),
            job_type: job_type.clone(),
            retries,
            state: JobState::Created,
            backoff_deadline_ms: None,
            variables: Value::Null,
            error_message: None,
        };
        self.store.save_job(&job).await?;
        self.store
            .append_event(&EngineEvent::JobCreated {
                job_key: job.key,
                kind,
                listener_event_type,
                process_instance_key: element.process_instance_key,
                element_instance_key: element.key,
                element_id: element.element_id.clone(),
                job_type,
                retries,
                scope_snapshot_hash,
            })
            .await?;
        debug!(job_key = job.key, job_type = %job.job_type, ?kind, "job created");
        Ok(job.key)
    }

    async fn require_job(&self, job_key: Key, action: &str) -> Result<Job, EngineError> {
        match self.store.load_job(job_key).await? {
            Some(job) => Ok(job),
            None => Err(Rejection::not_found(format!(
                "Expected to {action} job with key '{job_key}', but no such job was found"
            ))
            .into()),
        }
    }

    /// Worker action: complete the job with a variables payload. Returns
    /// the completed job and the parsed document; the caller merges it and
    /// resumes the owning transition.
    pub(crate) async fn complete(
        &self,
        job_key: Key,
        payload: &Value,
    ) -> Result<(Job, Map<String, Value>), EngineError> {
        let mut job = self.require_job(job_key, "complete").await?;
        if job.state != JobState::Created {
            return Err(Rejection::invalid_state(format!(
                "Expected to complete job with key '{job_key}', but it is in state '{:?}'",
                job.state
            ))
            .into());
        }
        let document = payload_document(payload)?;
        job.state = JobState::Completed;
        job.variables = payload.clone();
        self.store.save_job(&job).await?;
        self.store
            .append_event(&EngineEvent::JobCompleted {
                job_key,
                job_type: job.job_type.clone(),
                kind: job.kind,
                variables: payload.clone(),
            })
            .await?;
        debug!(job_key, job_type = %job.job_type, "job completed");
        Ok((job, document))
    }

    /// Worker action: fail the job, setting its remaining retries. With
    /// retries left the job stays completable (or recurs after the given
    /// backoff); with none left an incident is raised and the element
    /// instance suspends.
    pub(crate) async fn fail(
        &self,
        incidents: &IncidentManager,
        job_key: Key,
        retries: u32,
        backoff_ms: Option<u64>,
        error_message: Option<String>,
        now_ms: Timestamp,
    ) -> Result<(), EngineError> {
        let mut job = self.require_job(job_key, "fail").await?;
        if job.state != JobState::Created {
            return Err(Rejection::invalid_state(format!(
                "Expected to fail job with key '{job_key}', but it is in state '{:?}'",
                job.state
            ))
            .into());
        }
        job.retries = retries;
        job.error_message = error_message.clone();
        self.store
            .append_event(&EngineEvent::JobFailed {
                job_key,
                job_type: job.job_type.clone(),
                retries,
                backoff_ms,
                error_message,
            })
            .await?;
        if retries == 0 {
            job.state = JobState::Failed;
            self.store.save_job(&job).await?;
            let element = require_element(self.store.as_ref(), job.element_instance_key).await?;
            let error_type = match job.kind {
                JobKind::ExecutionListener => IncidentErrorType::ExecutionListenerNoRetries,
                JobKind::Task => IncidentErrorType::JobNoRetries,
            };
            incidents
                .raise(
                    error_type,
                    "No more retries left.".to_string(),
                    &element,
                    Some(job_key),
                )
                .await?;
        } else if let Some(backoff) = backoff_ms {
            let deadline = now_ms + backoff as Timestamp;
            job.state = JobState::Failed;
            job.backoff_deadline_ms = Some(deadline);
            self.store.save_job(&job).await?;
            self.store.schedule_backoff(deadline, job_key).await?;
        } else {
            // Immediately activatable again under the same key.
            self.store.save_job(&job).await?;
        }
        Ok(())
    }

    /// Worker/operator action: reset the retries of a failed job. Does not
    /// by itself resume anything; incident resolution does.
    pub(crate) async fn update_retries(&self, job_key: Key, retries: u32) -> Result<(), EngineError> {
        if retries == 0 {
            return Err(Rejection::invalid_argument(format!(
                "Expected to update retries of job with key '{job_key}' to a positive number, but was 0"
            ))
            .into());
        }
        let mut job = self.require_job(job_key, "update retries of").await?;
        if job.state.is_terminal() {
            return Err(Rejection::invalid_state(format!(
                "Expected to update retries of job with key '{job_key}', but it is in state '{:?}'",
                job.state
            ))
            .into());
        }
        job.retries = retries;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&EngineEvent::JobRetriesUpdated { job_key, retries })
            .await?;
        Ok(())
    }

    /// Worker action: throw a business error. Execution-listener jobs are
    /// not interruptible activities, so for them this is a synchronous
    /// rejection that mutates nothing. Task jobs raise an incident because
    /// error catch routing is owned by an external collaborator.
    pub(crate) async fn throw_error(
        &self,
        incidents: &IncidentManager,
        job_key: Key,
        error_code: &str,
    ) -> Result<(), EngineError> {
        let mut job = self.require_job(job_key, "throw an error for").await?;
        if job.kind == JobKind::ExecutionListener {
            return Err(Rejection::invalid_state(format!(
                "Cannot throw BPMN error from {} job with key '{}', type '{}' and processInstanceKey '{}'",
                kind_label(job.kind),
                job.key,
                job.job_type,
                job.process_instance_key
            ))
            .into());
        }
        if job.state != JobState::Created {
            return Err(Rejection::invalid_state(format!(
                "Expected to throw an error for job with key '{job_key}', but it is in state '{:?}'",
                job.state
            ))
            .into());
        }
        job.state = JobState::Failed;
        job.error_message = Some(format!("error code '{error_code}' thrown"));
        self.store.save_job(&job).await?;
        let element = require_element(self.store.as_ref(), job.element_instance_key).await?;
        incidents
            .raise(
                IncidentErrorType::UnhandledErrorEvent,
                format!(
                    "Expected to throw an error event with the code '{error_code}', but it was not caught. No error events are available in the scope."
                ),
                &element,
                Some(job_key),
            )
            .await?;
        Ok(())
    }

    /// Engine-internal: cancel a non-terminal job during termination. Also
    /// resolves any incident pending on the owning element so cancellation
    /// never leaves a dangling open incident.
    pub(crate) async fn cancel(&self, incidents: &IncidentManager, job_key: Key) -> Result<()> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            return Ok(());
        };
        if job.state.is_terminal() {
            return Ok(());
        }
        job.state = JobState::Canceled;
        job.backoff_deadline_ms = None;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&EngineEvent::JobCanceled {
                job_key,
                job_type: job.job_type.clone(),
                kind: job.kind,
                listener_event_type: job.listener_event_type,
            })
            .await?;
        incidents
            .force_resolve_for_element(job.element_instance_key)
            .await?;
        debug!(job_key, job_type = %job.job_type, "job canceled");
        Ok(())
    }

    /// Recreate a failed job under its original key after a no-retries
    /// incident was resolved with fresh retries.
    pub(crate) async fn recreate(&self, job: &Job) -> Result<()> {
        let mut job = job.clone();
        job.state = JobState::Created;
        job.backoff_deadline_ms = None;
        self.store.save_job(&job).await?;
        self.store
            .append_event(&EngineEvent::JobRecurred {
                job_key: job.key,
                job_type: job.job_type.clone(),
            })
            .await?;
        Ok(())
    }

    /// Process expired backoff timers: each failed job with retries left
    /// becomes activatable again under its original key.
    pub(crate) async fn recur_due(&self, now_ms: Timestamp) -> Result<()> {
        for (_, job_key) in self.store.take_due_backoffs(now_ms).await? {
            let Some(mut job) = self.store.load_job(job_key).await? else {
                continue;
            };
            if job.state != JobState::Failed || job.retries == 0 {
                continue;
            }
            job.state = JobState::Created;
            job.backoff_deadline_ms = None;
            self.store.save_job(&job).await?;
            self.store
                .append_event(&EngineEvent::JobRecurred {
                    job_key,
                    job_type: job.job_type.clone(),
                })
                .await?;
            debug!(job_key, "job recurred after backoff");
        }
        Ok(())
    }

    /// Worker poll: snapshot the activatable jobs of a type together with
    /// the variables visible at their elements right now.
    pub(crate) async fn activate(
        &self,
        job_type: &str,
        max: usize,
    ) -> Result<Vec<ActivatedJob>> {
        let mut activated = Vec::new();
        for job in self.store.activatable_jobs(job_type, max).await? {
            let element = require_element(self.store.as_ref(), job.element_instance_key).await?;
            let scope_key = scope::evaluation_scope(self.store.as_ref(), &element).await?;
            let variables = scope::collect_visible(self.store.as_ref(), scope_key).await?;
            activated.push(ActivatedJob {
                key: job.key,
                kind: job.kind,
                listener_event_type: job.listener_event_type,
                process_instance_key: job.process_instance_key,
                element_instance_key: job.element_instance_key,
                element_id: job.element_id.clone(),
                job_type: job.job_type.clone(),
                retries: job.retries,
                variables,
            });
        }
        Ok(activated)
    }
}
