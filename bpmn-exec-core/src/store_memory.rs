use crate::definition::ProcessDefinition;
use crate::events::EngineEvent;
use crate::store::EngineStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// In-memory [`EngineStore`]. The reference backend for tests and embedded
/// use; everything lives behind one mutex, which matches the
/// single-threaded-per-partition processing model.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    definitions_by_id: BTreeMap<String, Arc<ProcessDefinition>>,
    definitions_by_key: BTreeMap<Key, Arc<ProcessDefinition>>,
    instances: BTreeMap<Key, ProcessInstance>,
    elements: BTreeMap<Key, ElementInstance>,
    jobs: BTreeMap<Key, Job>,
    incidents: BTreeMap<Key, Incident>,
    scopes: BTreeMap<Key, VariableScope>,
    joins: BTreeMap<(Key, String), u32>,
    timers: BTreeSet<(Timestamp, Key)>,
    events: Vec<EngineEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn put_definition(&self, definition: ProcessDefinition) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let definition = Arc::new(definition);
        inner
            .definitions_by_id
            .insert(definition.process_id.clone(), definition.clone());
        inner.definitions_by_key.insert(definition.key, definition);
        Ok(())
    }

    async fn definition_by_id(&self, process_id: &str) -> Result<Option<Arc<ProcessDefinition>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .definitions_by_id
            .get(process_id)
            .cloned())
    }

    async fn definition_by_key(&self, key: Key) -> Result<Option<Arc<ProcessDefinition>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .definitions_by_key
            .get(&key)
            .cloned())
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .insert(instance.key, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, key: Key) -> Result<Option<ProcessInstance>> {
        Ok(self.inner.lock().unwrap().instances.get(&key).cloned())
    }

    async fn save_element(&self, element: &ElementInstance) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .elements
            .insert(element.key, element.clone());
        Ok(())
    }

    async fn load_element(&self, key: Key) -> Result<Option<ElementInstance>> {
        Ok(self.inner.lock().unwrap().elements.get(&key).cloned())
    }

    async fn children_of_scope(&self, flow_scope_key: Key) -> Result<Vec<ElementInstance>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .elements
            .values()
            .filter(|e| e.flow_scope_key == Some(flow_scope_key))
            .cloned()
            .collect())
    }

    async fn elements_of_instance(
        &self,
        process_instance_key: Key,
    ) -> Result<Vec<ElementInstance>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .elements
            .values()
            .filter(|e| e.process_instance_key == process_instance_key)
            .cloned()
            .collect())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.inner.lock().unwrap().jobs.insert(job.key, job.clone());
        Ok(())
    }

    async fn load_job(&self, key: Key) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&key).cloned())
    }

    async fn activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Created && j.job_type == job_type)
            .take(max)
            .cloned()
            .collect())
    }

    async fn save_incident(&self, incident: &Incident) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .incidents
            .insert(incident.key, incident.clone());
        Ok(())
    }

    async fn load_incident(&self, key: Key) -> Result<Option<Incident>> {
        Ok(self.inner.lock().unwrap().incidents.get(&key).cloned())
    }

    async fn open_incident_for_element(
        &self,
        element_instance_key: Key,
    ) -> Result<Option<Incident>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .incidents
            .values()
            .find(|i| !i.resolved && i.element_instance_key == element_instance_key)
            .cloned())
    }

    async fn save_scope(&self, scope: &VariableScope) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .scopes
            .insert(scope.scope_key, scope.clone());
        Ok(())
    }

    async fn load_scope(&self, scope_key: Key) -> Result<Option<VariableScope>> {
        Ok(self.inner.lock().unwrap().scopes.get(&scope_key).cloned())
    }

    async fn join_arrive(&self, scope_key: Key, gateway_id: &str) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner
            .joins
            .entry((scope_key, gateway_id.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn join_reset(&self, scope_key: Key, gateway_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .joins
            .remove(&(scope_key, gateway_id.to_string()));
        Ok(())
    }

    async fn schedule_backoff(&self, deadline_ms: Timestamp, job_key: Key) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .timers
            .insert((deadline_ms, job_key));
        Ok(())
    }

    async fn take_due_backoffs(&self, now_ms: Timestamp) -> Result<Vec<(Timestamp, Key)>> {
        let mut inner = self.inner.lock().unwrap();
        let due: Vec<(Timestamp, Key)> = inner
            .timers
            .iter()
            .take_while(|(deadline, _)| *deadline <= now_ms)
            .copied()
            .collect();
        for entry in &due {
            inner.timers.remove(entry);
        }
        Ok(due)
    }

    async fn append_event(&self, event: &EngineEvent) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(event.clone());
        Ok(inner.events.len() as u64 - 1)
    }

    async fn read_events(&self, from_seq: u64) -> Result<Vec<(u64, EngineEvent)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .enumerate()
            .skip(from_seq as usize)
            .map(|(i, e)| (i as u64, e.clone()))
            .collect())
    }
}
