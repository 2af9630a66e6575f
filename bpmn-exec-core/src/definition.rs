use crate::expression::Expression;
use crate::types::{BpmnElementType, EventKind, Key, ListenerEventType};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::BTreeMap;
use thiserror::Error;

/// Default retry count for jobs whose descriptor does not set one.
pub const DEFAULT_RETRIES: u32 = 3;

// ─── Static descriptors ───────────────────────────────────────

/// A declared extension point on an element. Compiled once per process
/// definition; element instances reference these, never copy them.
#[derive(Clone, Debug)]
pub struct ExecutionListener {
    pub event_type: ListenerEventType,
    pub job_type: Expression,
    pub retries: Expression,
}

impl ExecutionListener {
    pub fn start(job_type: Expression) -> Self {
        Self {
            event_type: ListenerEventType::Start,
            job_type,
            retries: Expression::literal(DEFAULT_RETRIES),
        }
    }

    pub fn end(job_type: Expression) -> Self {
        Self {
            event_type: ListenerEventType::End,
            job_type,
            retries: Expression::literal(DEFAULT_RETRIES),
        }
    }

    pub fn with_retries(mut self, retries: Expression) -> Self {
        self.retries = retries;
        self
    }
}

/// Input or output variable mapping: evaluate `source`, write `target`.
#[derive(Clone, Debug)]
pub struct VariableMapping {
    pub source: Expression,
    pub target: String,
}

impl VariableMapping {
    pub fn new(source: Expression, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
        }
    }
}

/// Worker-job configuration of a job-based activity.
#[derive(Clone, Debug)]
pub struct JobWorkerSpec {
    pub job_type: Expression,
    pub retries: Expression,
}

/// Multi-instance marker: one iteration per item of the evaluated input
/// collection, each in its own iteration scope.
#[derive(Clone, Debug)]
pub struct MultiInstance {
    pub input_collection: Expression,
    /// Variable name the current item is published under inside the
    /// iteration scope.
    pub input_element: Option<String>,
}

/// Immutable description of one element of a process definition.
#[derive(Clone, Debug)]
pub struct ElementDescriptor {
    pub id: String,
    pub element_type: BpmnElementType,
    pub event_kind: EventKind,
    /// Lexical parent element id; `None` for direct children of the
    /// process root.
    pub flow_scope: Option<String>,
    pub listeners: Vec<ExecutionListener>,
    pub job: Option<JobWorkerSpec>,
    pub inputs: Vec<VariableMapping>,
    pub outputs: Vec<VariableMapping>,
    pub multi_instance: Option<MultiInstance>,
}

impl ElementDescriptor {
    fn new(id: impl Into<String>, element_type: BpmnElementType) -> Self {
        Self {
            id: id.into(),
            element_type,
            event_kind: EventKind::None,
            flow_scope: None,
            listeners: Vec::new(),
            job: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            multi_instance: None,
        }
    }

    pub fn start_event(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::StartEvent)
    }

    pub fn end_event(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::EndEvent)
    }

    pub fn service_task(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        let mut desc = Self::new(id, BpmnElementType::ServiceTask);
        desc.job = Some(JobWorkerSpec {
            job_type: Expression::literal(job_type.into()),
            retries: Expression::literal(DEFAULT_RETRIES),
        });
        desc
    }

    pub fn user_task(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        let mut desc = Self::new(id, BpmnElementType::UserTask);
        desc.job = Some(JobWorkerSpec {
            job_type: Expression::literal(job_type.into()),
            retries: Expression::literal(DEFAULT_RETRIES),
        });
        desc
    }

    pub fn manual_task(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::ManualTask)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::Task)
    }

    pub fn receive_task(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::ReceiveTask)
    }

    pub fn sub_process(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::SubProcess)
    }

    pub fn event_sub_process(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::EventSubProcess)
    }

    pub fn exclusive_gateway(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::ExclusiveGateway)
    }

    pub fn parallel_gateway(id: impl Into<String>) -> Self {
        Self::new(id, BpmnElementType::ParallelGateway)
    }

    pub fn boundary_event(id: impl Into<String>, kind: EventKind) -> Self {
        let mut desc = Self::new(id, BpmnElementType::BoundaryEvent);
        desc.event_kind = kind;
        desc
    }

    pub fn event_kind(mut self, kind: EventKind) -> Self {
        self.event_kind = kind;
        self
    }

    /// Place this element inside the given sub-process scope.
    pub fn in_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.flow_scope = Some(scope_id.into());
        self
    }

    pub fn start_listener(mut self, job_type: impl Into<String>) -> Self {
        self.listeners
            .push(ExecutionListener::start(Expression::literal(job_type.into())));
        self
    }

    pub fn end_listener(mut self, job_type: impl Into<String>) -> Self {
        self.listeners
            .push(ExecutionListener::end(Expression::literal(job_type.into())));
        self
    }

    pub fn listener(mut self, listener: ExecutionListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replace the job type with an expression (job-based tasks only).
    pub fn job_type_expression(mut self, source: impl Into<String>) -> Self {
        if let Some(job) = self.job.as_mut() {
            job.job_type = Expression::expr(source.into());
        }
        self
    }

    pub fn job_retries(mut self, retries: Expression) -> Self {
        if let Some(job) = self.job.as_mut() {
            job.retries = retries;
        }
        self
    }

    pub fn input(mut self, source: Expression, target: impl Into<String>) -> Self {
        self.inputs.push(VariableMapping::new(source, target));
        self
    }

    pub fn output(mut self, source: Expression, target: impl Into<String>) -> Self {
        self.outputs.push(VariableMapping::new(source, target));
        self
    }

    pub fn multi_instance(mut self, multi_instance: MultiInstance) -> Self {
        self.multi_instance = Some(multi_instance);
        self
    }

    pub fn listeners_for(&self, event_type: ListenerEventType) -> Vec<&ExecutionListener> {
        self.listeners
            .iter()
            .filter(|l| l.event_type == event_type)
            .collect()
    }
}

// ─── Definition & builder ─────────────────────────────────────

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("duplicate element id '{0}'")]
    DuplicateElement(String),
    #[error("sequence flow references unknown element '{0}'")]
    UnknownFlowElement(String),
    #[error("sequence flow '{from}' -> '{to}' crosses scope boundaries")]
    FlowCrossesScope { from: String, to: String },
    #[error("element '{0}' references unknown flow scope '{1}'")]
    UnknownScope(String, String),
    #[error("element '{element_id}' of type {element_type:?} does not support {event_type:?} execution listeners")]
    UnsupportedListener {
        element_id: String,
        element_type: BpmnElementType,
        event_type: ListenerEventType,
    },
    #[error("element '{0}' of type {1:?} cannot carry a job worker configuration")]
    UnsupportedJob(String, BpmnElementType),
    #[error("element '{0}' of type {1:?} cannot be multi-instance")]
    UnsupportedMultiInstance(String, BpmnElementType),
    #[error("scope '{0}' has no start event")]
    MissingStartEvent(String),
}

/// Immutable compiled process definition. Produced by the builder (the
/// XML/deployment pipeline that would normally feed this is an external
/// collaborator), consumed read-only by the engine.
#[derive(Clone, Debug)]
pub struct ProcessDefinition {
    pub key: Key,
    pub process_id: String,
    root: ElementDescriptor,
    elements: BTreeMap<String, ElementDescriptor>,
    /// Declaration order, for deterministic iteration.
    order: Vec<String>,
    flow_graph: DiGraph<String, ()>,
    node_index: BTreeMap<String, NodeIndex>,
}

impl ProcessDefinition {
    /// Descriptor of an element, the process root included.
    pub fn descriptor(&self, element_id: &str) -> Option<&ElementDescriptor> {
        if element_id == self.process_id {
            Some(&self.root)
        } else {
            self.elements.get(element_id)
        }
    }

    /// Direct children of a scope, in declaration order. `None` addresses
    /// the process root scope.
    pub fn children_of(&self, scope_id: Option<&str>) -> Vec<&ElementDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.elements.get(id))
            .filter(|d| d.flow_scope.as_deref() == scope_id)
            .collect()
    }

    /// The start event a scope begins with.
    pub fn initial_element(&self, scope_id: Option<&str>) -> Option<&ElementDescriptor> {
        self.children_of(scope_id)
            .into_iter()
            .find(|d| d.element_type == BpmnElementType::StartEvent)
    }

    /// Outgoing sequence-flow targets in declaration order.
    pub fn outgoing_flows(&self, element_id: &str) -> Vec<&str> {
        let Some(&idx) = self.node_index.get(element_id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .flow_graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        edges.sort_by_key(|(id, _)| *id);
        edges
            .into_iter()
            .map(|(_, target)| self.flow_graph[target].as_str())
            .collect()
    }

    /// Number of incoming sequence flows (parallel-join arity).
    pub fn incoming_count(&self, element_id: &str) -> usize {
        self.node_index
            .get(element_id)
            .map(|&idx| {
                self.flow_graph
                    .edges_directed(idx, Direction::Incoming)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Declarative builder producing an immutable [`ProcessDefinition`].
#[derive(Debug)]
pub struct ProcessDefinitionBuilder {
    process_id: String,
    listeners: Vec<ExecutionListener>,
    elements: Vec<ElementDescriptor>,
    flows: Vec<(String, String)>,
}

impl ProcessDefinitionBuilder {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            listeners: Vec::new(),
            elements: Vec::new(),
            flows: Vec::new(),
        }
    }

    /// Process-level start execution listener.
    pub fn start_listener(mut self, job_type: impl Into<String>) -> Self {
        self.listeners
            .push(ExecutionListener::start(Expression::literal(job_type.into())));
        self
    }

    /// Process-level end execution listener.
    pub fn end_listener(mut self, job_type: impl Into<String>) -> Self {
        self.listeners
            .push(ExecutionListener::end(Expression::literal(job_type.into())));
        self
    }

    pub fn listener(mut self, listener: ExecutionListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn element(mut self, descriptor: ElementDescriptor) -> Self {
        self.elements.push(descriptor);
        self
    }

    pub fn flow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.flows.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<ProcessDefinition, DefinitionError> {
        let mut elements = BTreeMap::new();
        let mut order = Vec::new();
        for descriptor in &self.elements {
            if elements
                .insert(descriptor.id.clone(), descriptor.clone())
                .is_some()
                || descriptor.id == self.process_id
            {
                return Err(DefinitionError::DuplicateElement(descriptor.id.clone()));
            }
            order.push(descriptor.id.clone());
        }

        for descriptor in elements.values() {
            validate_descriptor(descriptor, &elements)?;
        }

        // Every scope that contains elements needs an entry point.
        let scopes: Vec<Option<String>> = std::iter::once(None)
            .chain(
                elements
                    .values()
                    .filter(|d| d.element_type.introduces_scope())
                    .map(|d| Some(d.id.clone())),
            )
            .collect();
        for scope in scopes {
            let children: Vec<_> = elements
                .values()
                .filter(|d| d.flow_scope == scope)
                .collect();
            let has_start = children
                .iter()
                .any(|d| d.element_type == BpmnElementType::StartEvent);
            if !children.is_empty() && !has_start {
                return Err(DefinitionError::MissingStartEvent(
                    scope.unwrap_or_else(|| self.process_id.clone()),
                ));
            }
        }

        let mut flow_graph = DiGraph::new();
        let mut node_index = BTreeMap::new();
        for id in &order {
            node_index.insert(id.clone(), flow_graph.add_node(id.clone()));
        }
        for (from, to) in &self.flows {
            let (Some(&a), Some(&b)) = (node_index.get(from), node_index.get(to)) else {
                let missing = if node_index.contains_key(from) { to } else { from };
                return Err(DefinitionError::UnknownFlowElement(missing.clone()));
            };
            if elements[from].flow_scope != elements[to].flow_scope {
                return Err(DefinitionError::FlowCrossesScope {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            flow_graph.add_edge(a, b, ());
        }

        let mut root = ElementDescriptor::new(self.process_id.clone(), BpmnElementType::Process);
        root.listeners = self.listeners;
        for listener in &root.listeners {
            if !root
                .element_type
                .supports_listeners(listener.event_type, EventKind::None)
            {
                return Err(DefinitionError::UnsupportedListener {
                    element_id: root.id.clone(),
                    element_type: root.element_type,
                    event_type: listener.event_type,
                });
            }
        }

        Ok(ProcessDefinition {
            key: 0,
            process_id: self.process_id,
            root,
            elements,
            order,
            flow_graph,
            node_index,
        })
    }
}

fn validate_descriptor(
    descriptor: &ElementDescriptor,
    elements: &BTreeMap<String, ElementDescriptor>,
) -> Result<(), DefinitionError> {
    if let Some(scope) = &descriptor.flow_scope {
        match elements.get(scope) {
            Some(parent) if parent.element_type.introduces_scope() => {}
            _ => {
                return Err(DefinitionError::UnknownScope(
                    descriptor.id.clone(),
                    scope.clone(),
                ))
            }
        }
    }
    for listener in &descriptor.listeners {
        if !descriptor
            .element_type
            .supports_listeners(listener.event_type, descriptor.event_kind)
        {
            return Err(DefinitionError::UnsupportedListener {
                element_id: descriptor.id.clone(),
                element_type: descriptor.element_type,
                event_type: listener.event_type,
            });
        }
    }
    if descriptor.job.is_some() && !descriptor.element_type.is_job_worker_task() {
        return Err(DefinitionError::UnsupportedJob(
            descriptor.id.clone(),
            descriptor.element_type,
        ));
    }
    if descriptor.multi_instance.is_some()
        && !matches!(
            descriptor.element_type,
            BpmnElementType::ServiceTask
                | BpmnElementType::UserTask
                | BpmnElementType::ScriptTask
                | BpmnElementType::BusinessRuleTask
                | BpmnElementType::SendTask
                | BpmnElementType::SubProcess
                | BpmnElementType::Task
                | BpmnElementType::ManualTask
        )
    {
        return Err(DefinitionError::UnsupportedMultiInstance(
            descriptor.id.clone(),
            descriptor.element_type,
        ));
    }
    Ok(())
}
