use crate::definition::{ElementDescriptor, ProcessDefinition};
use crate::engine::Step;
use crate::events::EngineEvent;
use crate::expression::{self, ExpressionEvaluator};
use crate::incidents::IncidentManager;
use crate::jobs::JobManager;
use crate::listeners::{ListenerScheduler, ScheduleOutcome};
use crate::scope::{self, MergeKind};
use crate::store::{definition_for_instance, require_element, EngineStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Drives every element instance through
/// `Activating → Activated → Completing → Completed` (with the orthogonal
/// `Terminating → Terminated` path) and is the single entry point other
/// components re-enter through. The two `continue_*` methods are the
/// idempotent transition requests: they consult the listener scheduler
/// first and only perform the native effect once the checkpoint's chain is
/// exhausted.
pub struct LifecycleController {
    store: Arc<dyn EngineStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    keys: Arc<KeyGenerator>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn EngineStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        keys: Arc<KeyGenerator>,
    ) -> Self {
        Self {
            store,
            evaluator,
            keys,
        }
    }

    async fn transition(
        &self,
        element: &mut ElementInstance,
        state: ElementLifecycleState,
    ) -> Result<()> {
        element.state = state;
        self.store.save_element(element).await?;
        self.store
            .append_event(&EngineEvent::element_transition(element, state))
            .await?;
        debug!(
            element_id = %element.element_id,
            key = element.key,
            state = state.as_str(),
            "element transitioned"
        );
        Ok(())
    }

    /// Instantiate an element and enter `Activating`. For a multi-instance
    /// activity this creates the synthetic body; iterations are spawned by
    /// the body's activation with `item` set.
    pub async fn activate(
        &self,
        process_instance_key: Key,
        element_id: &str,
        flow_scope_key: Option<Key>,
        item: Option<Value>,
    ) -> Result<Vec<Step>> {
        let definition = definition_for_instance(self.store.as_ref(), process_instance_key).await?;
        let descriptor = definition
            .descriptor(element_id)
            .ok_or_else(|| anyhow!("unknown element '{element_id}'"))?;

        let is_body = descriptor.multi_instance.is_some() && item.is_none();
        let element_type = if is_body {
            BpmnElementType::MultiInstanceBody
        } else {
            descriptor.element_type
        };
        let key = match flow_scope_key {
            // The root element instance shares the process instance key.
            None => process_instance_key,
            Some(_) => self.keys.next_key(),
        };
        let element = ElementInstance {
            key,
            process_instance_key,
            element_id: element_id.to_string(),
            element_type,
            state: ElementLifecycleState::Activating,
            flow_scope_key,
            listener_index: 0,
            active_job_key: None,
            multi_instance_item: item.clone(),
        };
        self.store.save_element(&element).await?;
        self.store
            .append_event(&EngineEvent::element_transition(
                &element,
                ElementLifecycleState::Activating,
            ))
            .await?;

        if element.owns_scope() {
            let parent = match flow_scope_key {
                None => None,
                Some(parent_key) => Some(scope::nearest_scope(self.store.as_ref(), parent_key).await?),
            };
            self.store
                .save_scope(&VariableScope {
                    scope_key: key,
                    parent,
                    process_instance_key,
                    variables: Default::default(),
                })
                .await?;
            // Publish the iteration's collection item into its scope.
            if let (Some(item_value), Some(multi_instance)) = (&item, &descriptor.multi_instance) {
                if let Some(input_element) = &multi_instance.input_element {
                    let mut document = serde_json::Map::new();
                    document.insert(input_element.clone(), item_value.clone());
                    scope::merge(self.store.as_ref(), key, &document).await?;
                }
            }
        }

        Ok(vec![Step::ContinueActivation {
            element_instance_key: key,
        }])
    }

    /// Request the `Activating → Activated` transition. Idempotent: safe to
    /// re-enter after each listener completion and after incident
    /// resolution; suspends while a listener job or an incident is pending.
    pub async fn continue_activation(
        &self,
        scheduler: &ListenerScheduler,
        jobs: &JobManager,
        incidents: &IncidentManager,
        element_instance_key: Key,
    ) -> Result<Vec<Step>> {
        let mut element = require_element(self.store.as_ref(), element_instance_key).await?;
        if element.is_terminal()
            || element.state == ElementLifecycleState::Terminating
            || element.active_job_key.is_some()
        {
            return Ok(vec![]);
        }
        if self
            .store
            .open_incident_for_element(element_instance_key)
            .await?
            .is_some()
        {
            return Ok(vec![]);
        }
        let definition =
            definition_for_instance(self.store.as_ref(), element.process_instance_key).await?;
        let descriptor = definition
            .descriptor(&element.element_id)
            .ok_or_else(|| anyhow!("unknown element '{}'", element.element_id))?
            .clone();

        if element.state == ElementLifecycleState::Activating {
            // Start listeners run before the native activation effects;
            // their output is visible to the input mappings below.
            if element
                .element_type
                .supports_listeners(ListenerEventType::Start, descriptor.event_kind)
            {
                match scheduler
                    .schedule_next(jobs, incidents, element_instance_key, ListenerEventType::Start)
                    .await?
                {
                    ScheduleOutcome::JobCreated(_) | ScheduleOutcome::IncidentRaised(_) => {
                        return Ok(vec![])
                    }
                    ScheduleOutcome::Exhausted => {}
                }
                // The scheduler may have advanced the chain cursor.
                element = require_element(self.store.as_ref(), element_instance_key).await?;
            }
            if element.element_type.supports_io_mappings() && !descriptor.inputs.is_empty() {
                let scope_key = scope::evaluation_scope(self.store.as_ref(), &element).await?;
                let snapshot = scope::collect_visible(self.store.as_ref(), scope_key).await?;
                match scope::evaluate_mappings(self.evaluator.as_ref(), &descriptor.inputs, &snapshot)
                {
                    Ok(document) => {
                        let target =
                            scope::merge_target(self.store.as_ref(), &element, MergeKind::Activation)
                                .await?;
                        scope::merge(self.store.as_ref(), target, &document).await?;
                    }
                    Err(err) => {
                        incidents
                            .raise(IncidentErrorType::IoMappingError, err.message, &element, None)
                            .await?;
                        return Ok(vec![]);
                    }
                }
            }
            element.listener_index = 0;
            self.transition(&mut element, ElementLifecycleState::Activated)
                .await?;
        }
        if element.state != ElementLifecycleState::Activated {
            return Ok(vec![]);
        }

        self.on_activated(jobs, incidents, &element, &definition, &descriptor)
            .await
    }

    /// Native behavior once an element is `Activated`.
    async fn on_activated(
        &self,
        jobs: &JobManager,
        incidents: &IncidentManager,
        element: &ElementInstance,
        definition: &ProcessDefinition,
        descriptor: &ElementDescriptor,
    ) -> Result<Vec<Step>> {
        match element.element_type {
            BpmnElementType::MultiInstanceBody => {
                // Re-entry after incident resolution must not double-spawn.
                if !self
                    .store
                    .children_of_scope(element.key)
                    .await?
                    .is_empty()
                {
                    return Ok(vec![]);
                }
                let multi_instance = descriptor
                    .multi_instance
                    .as_ref()
                    .ok_or_else(|| anyhow!("element '{}' is not multi-instance", element.element_id))?;
                let scope_key = scope::evaluation_scope(self.store.as_ref(), element).await?;
                let snapshot = scope::collect_visible(self.store.as_ref(), scope_key).await?;
                let items = match expression::resolve_array(
                    self.evaluator.as_ref(),
                    &multi_instance.input_collection,
                    &snapshot,
                ) {
                    Ok(items) => items,
                    Err(err) => {
                        incidents
                            .raise(
                                IncidentErrorType::ExtractValueError,
                                err.message,
                                element,
                                None,
                            )
                            .await?;
                        return Ok(vec![]);
                    }
                };
                if items.is_empty() {
                    return Ok(vec![Step::Complete {
                        element_instance_key: element.key,
                    }]);
                }
                Ok(items
                    .into_iter()
                    .map(|item| Step::Activate {
                        process_instance_key: element.process_instance_key,
                        element_id: element.element_id.clone(),
                        flow_scope_key: Some(element.key),
                        item: Some(item),
                    })
                    .collect())
            }
            BpmnElementType::Process
            | BpmnElementType::SubProcess
            | BpmnElementType::EventSubProcess => {
                let scope_id = if element.flow_scope_key.is_none() {
                    None
                } else {
                    Some(element.element_id.as_str())
                };
                match definition.initial_element(scope_id) {
                    Some(start) => Ok(vec![Step::Activate {
                        process_instance_key: element.process_instance_key,
                        element_id: start.id.clone(),
                        flow_scope_key: Some(element.key),
                        item: None,
                    }]),
                    None => Ok(vec![Step::Complete {
                        element_instance_key: element.key,
                    }]),
                }
            }
            // Awaits the external messaging collaborator; only termination
            // moves it on.
            BpmnElementType::ReceiveTask => Ok(vec![]),
            _ if descriptor.job.is_some() => {
                if element.active_job_key.is_some() {
                    return Ok(vec![]);
                }
                let spec = descriptor.job.as_ref().expect("job spec checked");
                let scope_key = scope::evaluation_scope(self.store.as_ref(), element).await?;
                let snapshot = scope::collect_visible(self.store.as_ref(), scope_key).await?;
                let job_type = match expression::resolve_string(
                    self.evaluator.as_ref(),
                    &spec.job_type,
                    &snapshot,
                ) {
                    Ok(job_type) => job_type,
                    Err(err) => {
                        incidents
                            .raise(
                                IncidentErrorType::ExtractValueError,
                                err.message,
                                element,
                                None,
                            )
                            .await?;
                        return Ok(vec![]);
                    }
                };
                let retries = match expression::resolve_retries(
                    self.evaluator.as_ref(),
                    &spec.retries,
                    &snapshot,
                ) {
                    Ok(retries) => retries,
                    Err(err) => {
                        incidents
                            .raise(
                                IncidentErrorType::ExtractValueError,
                                err.message,
                                element,
                                None,
                            )
                            .await?;
                        return Ok(vec![]);
                    }
                };
                let job_key = jobs
                    .create(
                        JobKind::Task,
                        None,
                        element,
                        job_type,
                        retries,
                        Some(expression::snapshot_hash(&snapshot)),
                    )
                    .await?;
                let mut element = element.clone();
                element.active_job_key = Some(job_key);
                self.store.save_element(&element).await?;
                Ok(vec![])
            }
            // Pass-through elements complete within the same processing
            // step.
            _ => Ok(vec![Step::Complete {
                element_instance_key: element.key,
            }]),
        }
    }

    /// Request the `Activated → Completing` transition.
    pub async fn begin_completion(&self, element_instance_key: Key) -> Result<Vec<Step>> {
        let mut element = require_element(self.store.as_ref(), element_instance_key).await?;
        match element.state {
            ElementLifecycleState::Activated => {
                element.listener_index = 0;
                self.transition(&mut element, ElementLifecycleState::Completing)
                    .await?;
                Ok(vec![Step::ContinueCompletion {
                    element_instance_key,
                }])
            }
            ElementLifecycleState::Completing => Ok(vec![Step::ContinueCompletion {
                element_instance_key,
            }]),
            _ => Ok(vec![]),
        }
    }

    /// Request the `Completing → Completed` transition. Idempotent like
    /// [`Self::continue_activation`]; end listeners run before the output
    /// mappings and the outgoing flows.
    pub async fn continue_completion(
        &self,
        scheduler: &ListenerScheduler,
        jobs: &JobManager,
        incidents: &IncidentManager,
        element_instance_key: Key,
    ) -> Result<Vec<Step>> {
        let mut element = require_element(self.store.as_ref(), element_instance_key).await?;
        if element.state != ElementLifecycleState::Completing || element.active_job_key.is_some() {
            return Ok(vec![]);
        }
        if self
            .store
            .open_incident_for_element(element_instance_key)
            .await?
            .is_some()
        {
            return Ok(vec![]);
        }
        let definition =
            definition_for_instance(self.store.as_ref(), element.process_instance_key).await?;
        let descriptor = definition
            .descriptor(&element.element_id)
            .ok_or_else(|| anyhow!("unknown element '{}'", element.element_id))?
            .clone();

        if element
            .element_type
            .supports_listeners(ListenerEventType::End, descriptor.event_kind)
        {
            match scheduler
                .schedule_next(jobs, incidents, element_instance_key, ListenerEventType::End)
                .await?
            {
                ScheduleOutcome::JobCreated(_) | ScheduleOutcome::IncidentRaised(_) => {
                    return Ok(vec![])
                }
                ScheduleOutcome::Exhausted => {}
            }
            element = require_element(self.store.as_ref(), element_instance_key).await?;
        }
        if element.element_type.supports_io_mappings() && !descriptor.outputs.is_empty() {
            let scope_key = scope::evaluation_scope(self.store.as_ref(), &element).await?;
            let snapshot = scope::collect_visible(self.store.as_ref(), scope_key).await?;
            match scope::evaluate_mappings(self.evaluator.as_ref(), &descriptor.outputs, &snapshot) {
                Ok(document) => {
                    let target =
                        scope::merge_target(self.store.as_ref(), &element, MergeKind::Completion)
                            .await?;
                    scope::merge(self.store.as_ref(), target, &document).await?;
                }
                Err(err) => {
                    incidents
                        .raise(IncidentErrorType::IoMappingError, err.message, &element, None)
                        .await?;
                    return Ok(vec![]);
                }
            }
        }
        self.transition(&mut element, ElementLifecycleState::Completed)
            .await?;
        self.on_completed(&element, &definition).await
    }

    /// Take outgoing flows or propagate completion into the owning scope.
    async fn on_completed(
        &self,
        element: &ElementInstance,
        definition: &ProcessDefinition,
    ) -> Result<Vec<Step>> {
        let Some(scope_key) = element.flow_scope_key else {
            // The root completed: the process instance is done.
            if let Some(mut instance) = self.store.load_instance(element.key).await? {
                if instance.state == ProcessInstanceState::Active {
                    instance.state = ProcessInstanceState::Completed;
                    self.store.save_instance(&instance).await?;
                    self.store
                        .append_event(&EngineEvent::ProcessInstanceCompleted {
                            process_instance_key: instance.key,
                        })
                        .await?;
                    info!(process_instance_key = instance.key, "process instance completed");
                }
            }
            return Ok(vec![]);
        };

        // Iterations report to their body; flows belong to the body alone.
        if element.multi_instance_item.is_some() {
            return Ok(vec![Step::ChildCompleted { scope_key }]);
        }

        let targets = definition.outgoing_flows(&element.element_id);
        if targets.is_empty() {
            return Ok(vec![Step::ChildCompleted { scope_key }]);
        }
        let mut steps = Vec::new();
        for target_id in targets {
            let target = definition
                .descriptor(target_id)
                .ok_or_else(|| anyhow!("unknown element '{target_id}'"))?;
            let incoming = definition.incoming_count(target_id);
            if target.element_type == BpmnElementType::ParallelGateway && incoming > 1 {
                let arrived = self.store.join_arrive(scope_key, target_id).await?;
                if arrived as usize >= incoming {
                    self.store.join_reset(scope_key, target_id).await?;
                } else {
                    continue;
                }
            }
            steps.push(Step::Activate {
                process_instance_key: element.process_instance_key,
                element_id: target_id.to_string(),
                flow_scope_key: Some(scope_key),
                item: None,
            });
        }
        Ok(steps)
    }

    /// A child of a scope reached a terminal state: complete the scope once
    /// nothing in it remains active.
    pub async fn on_child_completed(&self, scope_key: Key) -> Result<Vec<Step>> {
        let element = require_element(self.store.as_ref(), scope_key).await?;
        if element.state != ElementLifecycleState::Activated {
            return Ok(vec![]);
        }
        let children = self.store.children_of_scope(scope_key).await?;
        if children.iter().any(|child| !child.is_terminal()) {
            return Ok(vec![]);
        }
        Ok(vec![Step::Complete {
            element_instance_key: scope_key,
        }])
    }

    /// Terminate an element instance and its subtree, depth first. Cancels
    /// the active job, an in-flight end-listener job included (listeners
    /// are interrupted, never skipped "successfully"), and force-resolves
    /// open incidents.
    pub async fn terminate(
        &self,
        jobs: &JobManager,
        incidents: &IncidentManager,
        element_instance_key: Key,
    ) -> Result<Vec<Step>> {
        let mut element = require_element(self.store.as_ref(), element_instance_key).await?;
        if element.is_terminal() {
            return Ok(vec![]);
        }
        if element.state != ElementLifecycleState::Terminating {
            self.transition(&mut element, ElementLifecycleState::Terminating)
                .await?;
            if let Some(job_key) = element.active_job_key.take() {
                jobs.cancel(incidents, job_key).await?;
                self.store.save_element(&element).await?;
            }
            incidents
                .force_resolve_for_element(element_instance_key)
                .await?;
        }

        let pending: Vec<ElementInstance> = self
            .store
            .children_of_scope(element_instance_key)
            .await?
            .into_iter()
            .filter(|child| !child.is_terminal())
            .collect();
        if !pending.is_empty() {
            let mut steps: Vec<Step> = pending
                .into_iter()
                .map(|child| Step::Terminate {
                    element_instance_key: child.key,
                })
                .collect();
            // Re-check once the children are gone.
            steps.push(Step::Terminate {
                element_instance_key,
            });
            return Ok(steps);
        }

        self.transition(&mut element, ElementLifecycleState::Terminated)
            .await?;
        match element.flow_scope_key {
            None => {
                if let Some(mut instance) = self.store.load_instance(element.key).await? {
                    if instance.state == ProcessInstanceState::Active {
                        instance.state = ProcessInstanceState::Canceled;
                        self.store.save_instance(&instance).await?;
                        self.store
                            .append_event(&EngineEvent::ProcessInstanceCanceled {
                                process_instance_key: instance.key,
                            })
                            .await?;
                        info!(process_instance_key = instance.key, "process instance canceled");
                    }
                }
                Ok(vec![])
            }
            Some(parent_key) => {
                let parent = require_element(self.store.as_ref(), parent_key).await?;
                if parent.state == ElementLifecycleState::Terminating {
                    Ok(vec![Step::Terminate {
                        element_instance_key: parent_key,
                    }])
                } else {
                    Ok(vec![])
                }
            }
        }
    }
}
