use crate::events::EngineEvent;
use crate::store::EngineStore;
use crate::types::*;
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

/// Converts unrecoverable failures into resolvable incident records and
/// owns their lifecycle. Exactly one open incident may exist per element
/// instance; an open incident suspends that instance's progression and
/// nothing else.
pub struct IncidentManager {
    store: Arc<dyn EngineStore>,
    keys: Arc<KeyGenerator>,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn EngineStore>, keys: Arc<KeyGenerator>) -> Self {
        Self { store, keys }
    }

    /// Record an incident against an element instance. Returns the existing
    /// open incident's key if one is already pending.
    pub async fn raise(
        &self,
        error_type: IncidentErrorType,
        error_message: String,
        element: &ElementInstance,
        job_key: Option<Key>,
    ) -> Result<Key> {
        if let Some(existing) = self
            .store
            .open_incident_for_element(element.key)
            .await?
        {
            return Ok(existing.key);
        }
        let incident = Incident {
            key: self.keys.next_key(),
            error_type,
            error_message: error_message.clone(),
            process_instance_key: element.process_instance_key,
            element_instance_key: element.key,
            job_key,
            resolved: false,
        };
        self.store.save_incident(&incident).await?;
        self.store
            .append_event(&EngineEvent::IncidentCreated {
                incident_key: incident.key,
                error_type,
                error_message,
                process_instance_key: element.process_instance_key,
                element_instance_key: element.key,
                job_key,
            })
            .await?;
        warn!(
            incident_key = incident.key,
            element_id = %element.element_id,
            ?error_type,
            "incident created"
        );
        Ok(incident.key)
    }

    /// Mark an incident resolved. The caller re-triggers the failed
    /// operation; this only clears the suspension.
    pub async fn resolve(&self, incident_key: Key) -> Result<Incident, EngineError> {
        let Some(mut incident) = self.store.load_incident(incident_key).await? else {
            return Err(Rejection::not_found(format!(
                "Expected to resolve incident with key '{incident_key}', but no such incident was found"
            ))
            .into());
        };
        if incident.resolved {
            return Err(Rejection::invalid_state(format!(
                "Expected to resolve incident with key '{incident_key}', but it is already resolved"
            ))
            .into());
        }
        incident.resolved = true;
        self.store.save_incident(&incident).await?;
        self.store
            .append_event(&EngineEvent::IncidentResolved {
                incident_key,
                element_instance_key: incident.element_instance_key,
            })
            .await?;
        Ok(incident)
    }

    /// Resolve the open incident of an element without re-triggering
    /// anything. Used on cancellation so no dangling incident survives a
    /// canceled instance.
    pub async fn force_resolve_for_element(&self, element_instance_key: Key) -> Result<()> {
        if let Some(mut incident) = self
            .store
            .open_incident_for_element(element_instance_key)
            .await?
        {
            incident.resolved = true;
            self.store.save_incident(&incident).await?;
            self.store
                .append_event(&EngineEvent::IncidentResolved {
                    incident_key: incident.key,
                    element_instance_key,
                })
                .await?;
        }
        Ok(())
    }
}
