use crate::definition::ProcessDefinition;
use crate::events::EngineEvent;
use crate::expression::{ExpressionEvaluator, LookupEvaluator};
use crate::incidents::IncidentManager;
use crate::jobs::JobManager;
use crate::lifecycle::LifecycleController;
use crate::listeners::ListenerScheduler;
use crate::scope::{self, payload_document};
use crate::store::{require_element, EngineStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Internal follow-up work produced while applying one command. The drive
/// loop processes these in FIFO order until none remain, so every command
/// is applied as one deterministic batch of transitions.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Activate {
        process_instance_key: Key,
        element_id: String,
        flow_scope_key: Option<Key>,
        item: Option<Value>,
    },
    ContinueActivation {
        element_instance_key: Key,
    },
    Complete {
        element_instance_key: Key,
    },
    ContinueCompletion {
        element_instance_key: Key,
    },
    ChildCompleted {
        scope_key: Key,
    },
    Terminate {
        element_instance_key: Key,
    },
}

/// Runaway guard for the drive loop; generous, since a single command
/// never legitimately cascades anywhere near this.
const MAX_STEPS_PER_COMMAND: usize = 10_000;

/// The single-threaded execution core of one partition. Commands (create
/// instance, worker actions, incident resolution, timer advance) are
/// applied one at a time; each appends its events to the partition log
/// before the next is processed. Suspension (waiting on a job or an
/// incident) simply means no follow-up step exists for that element yet.
pub struct ProcessEngine {
    store: Arc<dyn EngineStore>,
    keys: Arc<KeyGenerator>,
    controller: LifecycleController,
    scheduler: ListenerScheduler,
    jobs: JobManager,
    incidents: IncidentManager,
    clock_ms: AtomicI64,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self::with_evaluator(store, Arc::new(LookupEvaluator), 1)
    }

    pub fn with_evaluator(
        store: Arc<dyn EngineStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        partition_id: u32,
    ) -> Self {
        let keys = Arc::new(KeyGenerator::new(partition_id));
        Self {
            controller: LifecycleController::new(store.clone(), evaluator.clone(), keys.clone()),
            scheduler: ListenerScheduler::new(store.clone(), evaluator),
            jobs: JobManager::new(store.clone(), keys.clone()),
            incidents: IncidentManager::new(store.clone(), keys.clone()),
            store,
            keys,
            clock_ms: AtomicI64::new(0),
        }
    }

    pub fn now_ms(&self) -> Timestamp {
        self.clock_ms.load(Ordering::Relaxed)
    }

    async fn drive(&self, steps: Vec<Step>) -> Result<()> {
        let mut queue: VecDeque<Step> = steps.into();
        let mut processed = 0usize;
        while let Some(step) = queue.pop_front() {
            processed += 1;
            if processed > MAX_STEPS_PER_COMMAND {
                return Err(anyhow!("step limit exceeded while applying a command"));
            }
            let followups = match step {
                Step::Activate {
                    process_instance_key,
                    element_id,
                    flow_scope_key,
                    item,
                } => {
                    self.controller
                        .activate(process_instance_key, &element_id, flow_scope_key, item)
                        .await?
                }
                Step::ContinueActivation {
                    element_instance_key,
                } => {
                    self.controller
                        .continue_activation(
                            &self.scheduler,
                            &self.jobs,
                            &self.incidents,
                            element_instance_key,
                        )
                        .await?
                }
                Step::Complete {
                    element_instance_key,
                } => self.controller.begin_completion(element_instance_key).await?,
                Step::ContinueCompletion {
                    element_instance_key,
                } => {
                    self.controller
                        .continue_completion(
                            &self.scheduler,
                            &self.jobs,
                            &self.incidents,
                            element_instance_key,
                        )
                        .await?
                }
                Step::ChildCompleted { scope_key } => {
                    self.controller.on_child_completed(scope_key).await?
                }
                Step::Terminate {
                    element_instance_key,
                } => {
                    self.controller
                        .terminate(&self.jobs, &self.incidents, element_instance_key)
                        .await?
                }
            };
            queue.extend(followups);
        }
        Ok(())
    }

    // ── Deployment & instances ──

    /// Register a definition with this partition and assign its key.
    pub async fn deploy(&self, mut definition: ProcessDefinition) -> Result<Key, EngineError> {
        definition.key = self.keys.next_key();
        let key = definition.key;
        info!(process_id = %definition.process_id, key, "definition deployed");
        self.store.put_definition(definition).await?;
        Ok(key)
    }

    /// Create and start a process instance with an initial variables
    /// document. Runs until every activation path is suspended or done.
    pub async fn create_instance(
        &self,
        process_id: &str,
        variables: Value,
    ) -> Result<Key, EngineError> {
        let Some(definition) = self.store.definition_by_id(process_id).await? else {
            return Err(Rejection::not_found(format!(
                "Expected to create an instance of process '{process_id}', but no such definition was deployed"
            ))
            .into());
        };
        let document = payload_document(&variables)?;
        let key = self.keys.next_key();
        let instance = ProcessInstance {
            key,
            process_id: process_id.to_string(),
            definition_key: definition.key,
            state: ProcessInstanceState::Active,
        };
        self.store.save_instance(&instance).await?;
        self.store
            .append_event(&EngineEvent::ProcessInstanceCreated {
                process_instance_key: key,
                process_id: process_id.to_string(),
            })
            .await?;
        info!(process_instance_key = key, process_id, "process instance created");

        // Activate the root, seed its scope, then let the start-listener
        // chain (which must see the initial variables) run.
        let steps = self.controller.activate(key, process_id, None, None).await?;
        scope::merge(self.store.as_ref(), key, &document).await?;
        self.drive(steps).await?;
        Ok(key)
    }

    /// Cancel a process instance: every descendant is terminated, in-flight
    /// jobs are canceled, and open incidents are resolved.
    pub async fn cancel_instance(&self, process_instance_key: Key) -> Result<(), EngineError> {
        match self.store.load_instance(process_instance_key).await? {
            Some(instance) if !instance.state.is_terminal() => {}
            _ => {
                return Err(Rejection::not_found(format!(
                    "Expected to cancel process instance with key '{process_instance_key}', but no such active process instance was found"
                ))
                .into())
            }
        }
        self.drive(vec![Step::Terminate {
            element_instance_key: process_instance_key,
        }])
        .await?;
        Ok(())
    }

    // ── Worker protocol ──

    /// Poll activatable jobs of a type, snapshotting the variables visible
    /// at each job's element.
    pub async fn activate_jobs(
        &self,
        job_type: &str,
        max: usize,
    ) -> Result<Vec<ActivatedJob>, EngineError> {
        Ok(self.jobs.activate(job_type, max).await?)
    }

    /// Complete a job with a variables payload, then resume the owning
    /// transition: the next listener in the chain, the native transition
    /// once the chain is exhausted, or the element completion for task
    /// jobs.
    pub async fn complete_job(&self, job_key: Key, variables: Value) -> Result<(), EngineError> {
        let (job, document) = self.jobs.complete(job_key, &variables).await?;
        match job.kind {
            JobKind::ExecutionListener => {
                self.scheduler.complete_listener(&job, &document).await?;
                let step = match job.listener_event_type {
                    Some(ListenerEventType::Start) => Step::ContinueActivation {
                        element_instance_key: job.element_instance_key,
                    },
                    _ => Step::ContinueCompletion {
                        element_instance_key: job.element_instance_key,
                    },
                };
                self.drive(vec![step]).await?;
            }
            JobKind::Task => {
                let mut element =
                    require_element(self.store.as_ref(), job.element_instance_key).await?;
                element.active_job_key = None;
                self.store.save_element(&element).await?;
                let target =
                    scope::merge_target(self.store.as_ref(), &element, scope::MergeKind::Completion)
                        .await?;
                scope::merge(self.store.as_ref(), target, &document).await?;
                self.drive(vec![Step::Complete {
                    element_instance_key: element.key,
                }])
                .await?;
            }
        }
        Ok(())
    }

    /// Fail a job, setting remaining retries and an optional backoff.
    pub async fn fail_job(
        &self,
        job_key: Key,
        retries: u32,
        backoff_ms: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        self.jobs
            .fail(
                &self.incidents,
                job_key,
                retries,
                backoff_ms,
                error_message.map(str::to_string),
                self.now_ms(),
            )
            .await
    }

    pub async fn update_job_retries(&self, job_key: Key, retries: u32) -> Result<(), EngineError> {
        self.jobs.update_retries(job_key, retries).await
    }

    /// Throw a business error from a job. Rejected for execution-listener
    /// jobs; uncaught for task jobs (error routing is an external
    /// collaborator), which raises an incident.
    pub async fn throw_error(&self, job_key: Key, error_code: &str) -> Result<(), EngineError> {
        self.jobs
            .throw_error(&self.incidents, job_key, error_code)
            .await
    }

    // ── Incidents & operator surface ──

    /// Resolve an incident and re-trigger exactly the operation that
    /// failed: the suspended transition continuation for evaluation
    /// incidents, the job recreation for retry-exhaustion incidents.
    pub async fn resolve_incident(&self, incident_key: Key) -> Result<(), EngineError> {
        let incident = self.incidents.resolve(incident_key).await?;
        match incident.error_type {
            IncidentErrorType::ExtractValueError | IncidentErrorType::IoMappingError => {
                let element =
                    require_element(self.store.as_ref(), incident.element_instance_key).await?;
                let step = match element.state {
                    ElementLifecycleState::Activating | ElementLifecycleState::Activated => {
                        Some(Step::ContinueActivation {
                            element_instance_key: element.key,
                        })
                    }
                    ElementLifecycleState::Completing => Some(Step::ContinueCompletion {
                        element_instance_key: element.key,
                    }),
                    _ => None,
                };
                if let Some(step) = step {
                    self.drive(vec![step]).await?;
                }
            }
            IncidentErrorType::ExecutionListenerNoRetries
            | IncidentErrorType::JobNoRetries
            | IncidentErrorType::UnhandledErrorEvent => {
                let Some(job_key) = incident.job_key else {
                    return Ok(());
                };
                let Some(job) = self.store.load_job(job_key).await? else {
                    return Ok(());
                };
                if job.state != JobState::Failed {
                    return Ok(());
                }
                if job.retries > 0 {
                    self.jobs.recreate(&job).await?;
                } else {
                    // Pure retry: the failed condition still holds, so the
                    // incident is raised again immediately.
                    let element =
                        require_element(self.store.as_ref(), job.element_instance_key).await?;
                    self.incidents
                        .raise(
                            incident.error_type,
                            incident.error_message.clone(),
                            &element,
                            Some(job_key),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Merge a variables document into an existing scope. Used by
    /// operators to repair state before resolving an incident.
    pub async fn set_variables(
        &self,
        scope_key: Key,
        variables: Value,
    ) -> Result<(), EngineError> {
        let document = payload_document(&variables)?;
        if self.store.load_scope(scope_key).await?.is_none() {
            return Err(Rejection::not_found(format!(
                "Expected to update variables of scope with key '{scope_key}', but no such scope was found"
            ))
            .into());
        }
        scope::merge(self.store.as_ref(), scope_key, &document).await?;
        Ok(())
    }

    /// Advance the logical clock. Backoff expiry is handled here, in
    /// deadline order, as ordinary log events; no out-of-band mutation.
    pub async fn increase_time(&self, delta_ms: u64) -> Result<(), EngineError> {
        let now = self
            .clock_ms
            .fetch_add(delta_ms as i64, Ordering::Relaxed)
            + delta_ms as i64;
        self.jobs.recur_due(now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        ElementDescriptor, ExecutionListener, MultiInstance, ProcessDefinitionBuilder,
    };
    use crate::expression::Expression;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn engine() -> (Arc<MemoryStore>, ProcessEngine) {
        // Opt-in test logs via RUST_LOG.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let store = Arc::new(MemoryStore::new());
        let engine = ProcessEngine::new(store.clone());
        (store, engine)
    }

    async fn events(store: &MemoryStore) -> Vec<EngineEvent> {
        store
            .read_events(0)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, event)| event)
            .collect()
    }

    /// `(job_type, intent)` pairs of all job events, in log order.
    fn job_trace(events: &[EngineEvent]) -> Vec<(String, &'static str)> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::JobCreated { job_type, .. } => Some((job_type.clone(), "created")),
                EngineEvent::JobCompleted { job_type, .. } => Some((job_type.clone(), "completed")),
                EngineEvent::JobFailed { job_type, .. } => Some((job_type.clone(), "failed")),
                EngineEvent::JobRecurred { job_type, .. } => Some((job_type.clone(), "recurred")),
                EngineEvent::JobCanceled { job_type, .. } => Some((job_type.clone(), "canceled")),
                _ => None,
            })
            .collect()
    }

    /// Lifecycle states and listener completions of one element, in order.
    fn lifecycle_trace(events: &[EngineEvent], id: &str) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::ElementTransitioned {
                    element_id, state, ..
                } if element_id == id => Some(state.as_str().to_string()),
                EngineEvent::ExecutionListenerCompleted { element_id, .. } if element_id == id => {
                    Some("listener_completed".to_string())
                }
                _ => None,
            })
            .collect()
    }

    fn is_subsequence<T: PartialEq>(needle: &[T], hay: &[T]) -> bool {
        let mut hay_iter = hay.iter();
        needle.iter().all(|n| hay_iter.any(|h| h == n))
    }

    async fn job_key(store: &MemoryStore, job_type: &str) -> Key {
        store
            .activatable_jobs(job_type, 16)
            .await
            .unwrap()
            .first()
            .unwrap_or_else(|| panic!("no activatable job of type '{job_type}'"))
            .key
    }

    async fn complete_type(engine: &ProcessEngine, store: &MemoryStore, job_type: &str) {
        let key = job_key(store, job_type).await;
        engine.complete_job(key, Value::Null).await.unwrap();
    }

    fn instance_completed(events: &[EngineEvent], key: Key) -> bool {
        events.iter().any(|e| {
            matches!(e, EngineEvent::ProcessInstanceCompleted { process_instance_key } if *process_instance_key == key)
        })
    }

    fn open_incident(events: &[EngineEvent]) -> Option<(Key, IncidentErrorType, String)> {
        let mut open = None;
        for event in events {
            match event {
                EngineEvent::IncidentCreated {
                    incident_key,
                    error_type,
                    error_message,
                    ..
                } => open = Some((*incident_key, *error_type, error_message.clone())),
                EngineEvent::IncidentResolved { incident_key, .. } => {
                    if open.as_ref().map(|(k, _, _)| k) == Some(incident_key) {
                        open = None;
                    }
                }
                _ => {}
            }
        }
        open
    }

    fn service_task_process() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::service_task("task", "work")
                    .start_listener("el_start_1")
                    .start_listener("el_start_2")
                    .end_listener("el_end"),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn listeners_wrap_activation_and_completion_in_declared_order() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "el_start_1").await;
        complete_type(&engine, &store, "el_start_2").await;
        complete_type(&engine, &store, "work").await;
        complete_type(&engine, &store, "el_end").await;

        let events = events(&store).await;
        assert_eq!(
            job_trace(&events),
            vec![
                ("el_start_1".into(), "created"),
                ("el_start_1".into(), "completed"),
                ("el_start_2".into(), "created"),
                ("el_start_2".into(), "completed"),
                ("work".into(), "created"),
                ("work".into(), "completed"),
                ("el_end".into(), "created"),
                ("el_end".into(), "completed"),
            ]
        );
        assert_eq!(
            lifecycle_trace(&events, "task"),
            vec![
                "activating",
                "listener_completed",
                "listener_completed",
                "activated",
                "completing",
                "listener_completed",
                "completed",
            ]
        );
        assert!(instance_completed(&events, key));
    }

    #[tokio::test]
    async fn process_level_listeners_run_around_root_activation_and_completion() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .start_listener("p_start_1")
            .start_listener("p_start_2")
            .end_listener("p_end_1")
            .end_listener("p_end_2")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "p_start_1").await;
        complete_type(&engine, &store, "p_start_2").await;
        complete_type(&engine, &store, "p_end_1").await;
        complete_type(&engine, &store, "p_end_2").await;

        let events = events(&store).await;
        assert_eq!(
            job_trace(&events),
            vec![
                ("p_start_1".into(), "created"),
                ("p_start_1".into(), "completed"),
                ("p_start_2".into(), "created"),
                ("p_start_2".into(), "completed"),
                ("p_end_1".into(), "created"),
                ("p_end_1".into(), "completed"),
                ("p_end_2".into(), "created"),
                ("p_end_2".into(), "completed"),
            ]
        );
        assert!(is_subsequence(
            &[
                "activating".to_string(),
                "listener_completed".to_string(),
                "listener_completed".to_string(),
                "activated".to_string(),
                "completing".to_string(),
                "listener_completed".to_string(),
                "listener_completed".to_string(),
                "completed".to_string(),
            ],
            &lifecycle_trace(&events, "process"),
        ));
        assert!(instance_completed(&events, key));
    }

    #[tokio::test]
    async fn start_listener_variables_are_visible_to_the_elements_own_job() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::service_task("task", "work").start_listener("el"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_key = job_key(&store, "el").await;
        engine
            .complete_job(el_key, json!({"bar": 1}))
            .await
            .unwrap();

        let activated = engine.activate_jobs("work", 1).await.unwrap();
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].variables.get("bar"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn sub_process_end_listener_variables_reach_later_siblings() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::sub_process("sub").end_listener("sub_end_el"))
            .element(ElementDescriptor::start_event("sub_start").in_scope("sub"))
            .element(ElementDescriptor::end_event("sub_end").in_scope("sub"))
            .element(ElementDescriptor::service_task("later", "later_work"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "sub")
            .flow("sub", "later")
            .flow("later", "end")
            .flow("sub_start", "sub_end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_key = job_key(&store, "sub_end_el").await;
        engine
            .complete_job(el_key, json!({"end_el_var": "baz"}))
            .await
            .unwrap();

        let activated = engine.activate_jobs("later_work", 1).await.unwrap();
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].variables.get("end_el_var"), Some(&json!("baz")));
    }

    #[tokio::test]
    async fn multi_instance_listener_variables_never_leak_across_iterations() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::service_task("mi_task", "mi_work")
                    .start_listener("mi_el")
                    .multi_instance(MultiInstance {
                        input_collection: Expression::expr("items"),
                        input_element: Some("item".into()),
                    }),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "mi_task")
            .flow("mi_task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", json!({"items": ["a", "b"]}))
            .await
            .unwrap();

        // Both iterations have a start-listener job; each sees its own item.
        let listener_jobs = engine.activate_jobs("mi_el", 10).await.unwrap();
        assert_eq!(listener_jobs.len(), 2);
        let job_b = listener_jobs
            .iter()
            .find(|j| j.variables.get("item") == Some(&json!("b")))
            .expect("iteration for 'b'");
        engine
            .complete_job(job_b.key, json!({"leaked": "from_b"}))
            .await
            .unwrap();
        let job_a = engine.activate_jobs("mi_el", 10).await.unwrap();
        assert_eq!(job_a.len(), 1);
        engine.complete_job(job_a[0].key, Value::Null).await.unwrap();

        let work_jobs = engine.activate_jobs("mi_work", 10).await.unwrap();
        assert_eq!(work_jobs.len(), 2);
        for job in &work_jobs {
            match job.variables.get("item") {
                Some(item) if item == &json!("b") => {
                    assert_eq!(job.variables.get("leaked"), Some(&json!("from_b")));
                }
                _ => {
                    assert_eq!(job.variables.get("leaked"), None, "iteration scope leaked");
                }
            }
        }
        for job in work_jobs {
            engine.complete_job(job.key, Value::Null).await.unwrap();
        }
        assert!(instance_completed(&events(&store).await, key));
    }

    #[tokio::test]
    async fn failed_listener_retries_and_completes_without_rerunning_the_chain() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::service_task("task", "work").start_listener("el"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_key = job_key(&store, "el").await;
        engine.fail_job(el_key, 1, None, None).await.unwrap();
        // Still completable under the same key; no new job was created.
        engine.complete_job(el_key, Value::Null).await.unwrap();

        let events = events(&store).await;
        assert_eq!(
            job_trace(&events),
            vec![
                ("el".into(), "created"),
                ("el".into(), "failed"),
                ("el".into(), "completed"),
                ("work".into(), "created"),
            ]
        );
        assert!(open_incident(&events).is_none());
    }

    #[tokio::test]
    async fn failed_listener_recurs_after_backoff_under_the_same_key() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_key = job_key(&store, "el_start_1").await;
        engine
            .fail_job(el_key, 2, Some(60_000), Some("worker crashed"))
            .await
            .unwrap();
        assert!(engine
            .activate_jobs("el_start_1", 1)
            .await
            .unwrap()
            .is_empty());

        engine.increase_time(59_000).await.unwrap();
        assert!(engine
            .activate_jobs("el_start_1", 1)
            .await
            .unwrap()
            .is_empty());

        engine.increase_time(1_000).await.unwrap();
        let recurred = engine.activate_jobs("el_start_1", 1).await.unwrap();
        assert_eq!(recurred.len(), 1);
        assert_eq!(recurred[0].key, el_key);

        engine.complete_job(el_key, Value::Null).await.unwrap();
        let events = events(&store).await;
        assert!(is_subsequence(
            &[
                ("el_start_1".into(), "created"),
                ("el_start_1".into(), "failed"),
                ("el_start_1".into(), "recurred"),
                ("el_start_1".into(), "completed"),
                ("el_start_2".into(), "created"),
            ],
            &job_trace(&events),
        ));
    }

    #[tokio::test]
    async fn listener_expressions_evaluate_against_variables_of_earlier_listeners() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .start_listener("el_1")
            .listener(
                ExecutionListener::start(Expression::expr("listenerNameVar"))
                    .with_retries(Expression::expr("elRetries")),
            )
            .listener(
                ExecutionListener::end(Expression::literal("el_end"))
                    .with_retries(Expression::expr("endRetries")),
            )
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_1 = job_key(&store, "el_1").await;
        engine
            .complete_job(
                el_1,
                json!({
                    "listenerNameVar": "el_2_evaluated",
                    "elRetries": 6,
                    "endRetries": 11
                }),
            )
            .await
            .unwrap();
        complete_type(&engine, &store, "el_2_evaluated").await;
        complete_type(&engine, &store, "el_end").await;

        let created: Vec<(String, u32)> = events(&store)
            .await
            .iter()
            .filter_map(|event| match event {
                EngineEvent::JobCreated {
                    job_type, retries, ..
                } => Some((job_type.clone(), *retries)),
                _ => None,
            })
            .collect();
        assert_eq!(
            created,
            vec![
                ("el_1".into(), 3),
                ("el_2_evaluated".into(), 6),
                ("el_end".into(), 11),
            ]
        );
    }

    #[tokio::test]
    async fn expression_incident_recreates_only_the_failing_listener() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .start_listener("el_1")
            .listener(ExecutionListener::start(Expression::expr(
                "start_el_2_name_var",
            )))
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::manual_task("manual"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "manual")
            .flow("manual", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "el_1").await;

        let (incident_key, error_type, message) =
            open_incident(&events(&store).await).expect("incident");
        assert_eq!(error_type, IncidentErrorType::ExtractValueError);
        assert_eq!(
            message,
            "Expected result of the expression 'start_el_2_name_var' to be 'STRING', but was 'NULL'"
        );

        engine
            .set_variables(key, json!({"start_el_2_name_var": "el_2_evaluated"}))
            .await
            .unwrap();
        engine.resolve_incident(incident_key).await.unwrap();

        // Exactly one job for the first listener: it never re-ran.
        let trace = job_trace(&events(&store).await);
        assert_eq!(
            trace,
            vec![
                ("el_1".into(), "created"),
                ("el_1".into(), "completed"),
                ("el_2_evaluated".into(), "created"),
            ]
        );

        complete_type(&engine, &store, "el_2_evaluated").await;
        assert!(instance_completed(&events(&store).await, key));
    }

    #[tokio::test]
    async fn no_retries_incident_resolution_recreates_the_same_job() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::service_task("task", "work")
                    .start_listener("el_0")
                    .start_listener("el_1"),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "el_0").await;
        let el_1 = job_key(&store, "el_1").await;
        engine.fail_job(el_1, 0, None, None).await.unwrap();

        let (incident_key, error_type, message) =
            open_incident(&events(&store).await).expect("incident");
        assert_eq!(error_type, IncidentErrorType::ExecutionListenerNoRetries);
        assert_eq!(message, "No more retries left.");

        engine.update_job_retries(el_1, 1).await.unwrap();
        engine.resolve_incident(incident_key).await.unwrap();
        engine.complete_job(el_1, Value::Null).await.unwrap();

        let events = events(&store).await;
        assert!(is_subsequence(
            &[
                ("el_1".into(), "created"),
                ("el_1".into(), "failed"),
                ("el_1".into(), "recurred"),
                ("el_1".into(), "completed"),
                ("work".into(), "created"),
            ],
            &job_trace(&events),
        ));
        // The already-completed first listener ran exactly once.
        assert_eq!(
            job_trace(&events)
                .iter()
                .filter(|(t, intent)| t == "el_0" && *intent == "created")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn resolving_a_no_retries_incident_without_new_retries_re_raises_it() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let el_key = job_key(&store, "el_start_1").await;
        engine.fail_job(el_key, 0, None, None).await.unwrap();
        let (incident_key, _, _) = open_incident(&events(&store).await).unwrap();

        engine.resolve_incident(incident_key).await.unwrap();

        // The retry re-ran, found retries still exhausted, and suspended
        // again behind a fresh incident.
        let events = events(&store).await;
        let created_count = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::IncidentCreated { .. }))
            .count();
        assert_eq!(created_count, 2);
        assert!(open_incident(&events).is_some());
    }

    #[tokio::test]
    async fn cancellation_cancels_the_inflight_listener_job() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();
        let el_key = job_key(&store, "el_start_1").await;

        engine.cancel_instance(key).await.unwrap();

        let events_after_cancel = events(&store).await;
        assert!(events_after_cancel.iter().any(|e| matches!(
            e,
            EngineEvent::JobCanceled {
                job_key,
                kind: JobKind::ExecutionListener,
                listener_event_type: Some(ListenerEventType::Start),
                ..
            } if *job_key == el_key
        )));
        assert!(events_after_cancel.iter().any(|e| matches!(
            e,
            EngineEvent::ProcessInstanceCanceled { process_instance_key } if *process_instance_key == key
        )));
        assert!(is_subsequence(
            &["activating".to_string(), "terminating".to_string(), "terminated".to_string()],
            &lifecycle_trace(&events_after_cancel, "task"),
        ));
        let elements = store.elements_of_instance(key).await.unwrap();
        assert!(elements.iter().all(|e| e.is_terminal()));

        // No further job or listener events for the canceled instance.
        let seq_after = events_after_cancel.len();
        assert!(engine.activate_jobs("el_start_1", 1).await.unwrap().is_empty());
        let err = engine.complete_job(el_key, Value::Null).await.unwrap_err();
        assert_eq!(
            err.as_rejection().unwrap().rejection_type,
            RejectionType::InvalidState
        );
        assert_eq!(events(&store).await.len(), seq_after);
    }

    #[tokio::test]
    async fn cancellation_auto_resolves_the_open_incident_of_a_failed_listener_job() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();
        let el_key = job_key(&store, "el_start_1").await;
        engine.fail_job(el_key, 0, None, None).await.unwrap();
        assert!(open_incident(&events(&store).await).is_some());

        engine.cancel_instance(key).await.unwrap();

        let events = events(&store).await;
        assert!(open_incident(&events).is_none());
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::JobCanceled { job_key, .. } if *job_key == el_key)));
    }

    #[tokio::test]
    async fn throwing_an_error_from_a_listener_job_is_rejected_without_state_change() {
        let (store, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();
        let el_key = job_key(&store, "el_start_1").await;
        let events_before = events(&store).await.len();

        let err = engine.throw_error(el_key, "err").await.unwrap_err();
        let rejection = err.as_rejection().expect("rejection");
        assert_eq!(rejection.rejection_type, RejectionType::InvalidState);
        assert!(rejection
            .reason
            .starts_with("Cannot throw BPMN error from EXECUTION_LISTENER job"));

        // Nothing was recorded and the job is still completable.
        assert_eq!(events(&store).await.len(), events_before);
        engine.complete_job(el_key, Value::Null).await.unwrap();
    }

    #[tokio::test]
    async fn throwing_an_uncaught_error_from_a_task_job_raises_an_incident() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::service_task("task", "work"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let work_key = job_key(&store, "work").await;
        engine.throw_error(work_key, "oops").await.unwrap();

        let (_, error_type, message) = open_incident(&events(&store).await).expect("incident");
        assert_eq!(error_type, IncidentErrorType::UnhandledErrorEvent);
        assert!(message.contains("'oops'"));
        assert!(message.contains("not caught"));
    }

    #[tokio::test]
    async fn mappings_run_after_listeners_and_merge_with_observable_facts() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(
                ElementDescriptor::start_event("start")
                    .output(Expression::literal("aValue"), "startEventVar"),
            )
            .element(
                ElementDescriptor::service_task("task", "work")
                    .start_listener("el_start")
                    .end_listener("el_end_1")
                    .end_listener("el_end_2")
                    .input(Expression::literal("bValue"), "serviceTaskVar")
                    .output(Expression::expr("serviceTaskVar"), "copiedVar"),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        // The start listener runs first; its write is a create. The input
        // mapping then overwrites it, observably, as an update.
        let el_start = job_key(&store, "el_start").await;
        engine
            .complete_job(el_start, json!({"serviceTaskVar": "fromListener"}))
            .await
            .unwrap();

        let variable_facts: Vec<(String, &'static str, Value)> = events(&store)
            .await
            .iter()
            .filter_map(|event| match event {
                EngineEvent::VariableCreated { name, value, .. } => {
                    Some((name.clone(), "created", value.clone()))
                }
                EngineEvent::VariableUpdated { name, value, .. } => {
                    Some((name.clone(), "updated", value.clone()))
                }
                _ => None,
            })
            .collect();
        assert!(is_subsequence(
            &[
                ("startEventVar".into(), "created", json!("aValue")),
                ("serviceTaskVar".into(), "created", json!("fromListener")),
                ("serviceTaskVar".into(), "updated", json!("bValue")),
            ],
            &variable_facts,
        ));

        let work = engine.activate_jobs("work", 1).await.unwrap();
        assert_eq!(work[0].variables.get("serviceTaskVar"), Some(&json!("bValue")));
        engine
            .complete_job(work[0].key, json!({"x": 1}))
            .await
            .unwrap();

        // Task completion variables are visible to the end listeners.
        let el_end_1 = engine.activate_jobs("el_end_1", 1).await.unwrap();
        assert_eq!(el_end_1[0].variables.get("x"), Some(&json!(1)));
        engine
            .complete_job(el_end_1[0].key, json!({"startEventVar": "updated"}))
            .await
            .unwrap();
        complete_type(&engine, &store, "el_end_2").await;

        // The output mapping ran only after both end listeners.
        let events = events(&store).await;
        let copied_at = events
            .iter()
            .position(|e| matches!(e, EngineEvent::VariableCreated { name, .. } if name == "copiedVar"))
            .expect("output mapping fact");
        let last_listener_at = events
            .iter()
            .rposition(|e| matches!(e, EngineEvent::ExecutionListenerCompleted { .. }))
            .unwrap();
        assert!(copied_at > last_listener_at);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::VariableUpdated { name, value, .. }
                if name == "startEventVar" && value == &json!("updated")
        )));
        assert!(instance_completed(&events, key));
    }

    #[tokio::test]
    async fn io_mapping_incident_resolution_does_not_rerun_completed_listeners() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::service_task("task", "work")
                    .start_listener("el")
                    .input(Expression::expr("some_var"), "mapped"),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        // Listener first (the chain precedes the input mappings), then the
        // mapping fails on the missing variable.
        complete_type(&engine, &store, "el").await;
        let (incident_key, error_type, message) =
            open_incident(&events(&store).await).expect("incident");
        assert_eq!(error_type, IncidentErrorType::IoMappingError);
        assert_eq!(message, "No variable found with name 'some_var'");

        engine
            .set_variables(key, json!({"some_var": "fixed"}))
            .await
            .unwrap();
        engine.resolve_incident(incident_key).await.unwrap();

        // The retry resumed at the mapping: one listener job total, and the
        // task job is now created.
        let trace = job_trace(&events(&store).await);
        assert_eq!(
            trace,
            vec![
                ("el".into(), "created"),
                ("el".into(), "completed"),
                ("work".into(), "created"),
            ]
        );
    }

    #[tokio::test]
    async fn terminating_during_end_listeners_cancels_the_inflight_job() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::service_task("task", "work").end_listener("el_end"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "work").await;
        let el_end = job_key(&store, "el_end").await;

        engine.cancel_instance(key).await.unwrap();

        let events = events(&store).await;
        // The end listener was interrupted, not skipped "successfully".
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::JobCanceled {
                job_key,
                kind: JobKind::ExecutionListener,
                listener_event_type: Some(ListenerEventType::End),
                ..
            } if *job_key == el_end
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            EngineEvent::ExecutionListenerCompleted {
                event_type: ListenerEventType::End,
                ..
            }
        )));
        assert!(is_subsequence(
            &["completing".to_string(), "terminating".to_string(), "terminated".to_string()],
            &lifecycle_trace(&events, "task"),
        ));
    }

    #[tokio::test]
    async fn parallel_gateway_joins_all_branches_before_continuing() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::parallel_gateway("fork"))
            .element(ElementDescriptor::manual_task("a"))
            .element(ElementDescriptor::manual_task("b"))
            .element(ElementDescriptor::parallel_gateway("join"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        let events = events(&store).await;
        assert_eq!(
            lifecycle_trace(&events, "join"),
            vec!["activating", "activated", "completing", "completed"]
        );
        assert!(instance_completed(&events, key));
    }

    #[tokio::test]
    async fn empty_multi_instance_collection_completes_the_body_immediately() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::service_task("mi_task", "mi_work")
                    .start_listener("mi_el")
                    .multi_instance(MultiInstance {
                        input_collection: Expression::expr("items"),
                        input_element: Some("item".into()),
                    }),
            )
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "mi_task")
            .flow("mi_task", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", json!({"items": []}))
            .await
            .unwrap();

        let events = events(&store).await;
        assert!(job_trace(&events).is_empty());
        assert!(instance_completed(&events, key));
    }

    #[tokio::test]
    async fn receive_tasks_park_until_terminated() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .element(ElementDescriptor::start_event("start"))
            .element(ElementDescriptor::receive_task("wait"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "wait")
            .flow("wait", "end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        assert!(is_subsequence(
            &["activating".to_string(), "activated".to_string()],
            &lifecycle_trace(&events(&store).await, "wait"),
        ));
        engine.cancel_instance(key).await.unwrap();
        assert!(is_subsequence(
            &["terminating".to_string(), "terminated".to_string()],
            &lifecycle_trace(&events(&store).await, "wait"),
        ));
    }

    #[tokio::test]
    async fn sub_process_listener_jobs_complete_in_scope_order() {
        let (store, engine) = engine();
        let definition = ProcessDefinitionBuilder::new("process")
            .start_listener("p_start_el")
            .end_listener("p_end_el")
            .element(ElementDescriptor::start_event("start"))
            .element(
                ElementDescriptor::sub_process("sub")
                    .start_listener("sub_start_el")
                    .end_listener("sub_end_el"),
            )
            .element(ElementDescriptor::start_event("sub_start").in_scope("sub"))
            .element(ElementDescriptor::manual_task("inner").in_scope("sub"))
            .element(ElementDescriptor::end_event("sub_end").in_scope("sub"))
            .element(ElementDescriptor::end_event("end"))
            .flow("start", "sub")
            .flow("sub", "end")
            .flow("sub_start", "inner")
            .flow("inner", "sub_end")
            .build()
            .unwrap();
        engine.deploy(definition).await.unwrap();
        let key = engine
            .create_instance("process", Value::Null)
            .await
            .unwrap();

        complete_type(&engine, &store, "p_start_el").await;
        complete_type(&engine, &store, "sub_start_el").await;
        complete_type(&engine, &store, "sub_end_el").await;
        complete_type(&engine, &store, "p_end_el").await;

        let completed: Vec<String> = events(&store)
            .await
            .iter()
            .filter_map(|event| match event {
                EngineEvent::JobCompleted { job_type, .. } => Some(job_type.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            completed,
            vec!["p_start_el", "sub_start_el", "sub_end_el", "p_end_el"]
        );
        assert!(instance_completed(&events(&store).await, key));
    }

    #[tokio::test]
    async fn create_instance_rejects_non_object_variables() {
        let (_, engine) = engine();
        engine.deploy(service_task_process()).await.unwrap();
        let err = engine
            .create_instance("process", json!([1, 2]))
            .await
            .unwrap_err();
        assert_eq!(
            err.as_rejection().unwrap().rejection_type,
            RejectionType::InvalidArgument
        );
    }

    #[tokio::test]
    async fn commands_against_unknown_records_are_rejected_as_not_found() {
        let (_, engine) = engine();
        let err = engine.create_instance("ghost", Value::Null).await.unwrap_err();
        assert_eq!(
            err.as_rejection().unwrap().rejection_type,
            RejectionType::NotFound
        );
        let err = engine.cancel_instance(42).await.unwrap_err();
        assert_eq!(
            err.as_rejection().unwrap().rejection_type,
            RejectionType::NotFound
        );
        let err = engine.complete_job(42, Value::Null).await.unwrap_err();
        assert_eq!(
            err.as_rejection().unwrap().rejection_type,
            RejectionType::NotFound
        );
    }
}
