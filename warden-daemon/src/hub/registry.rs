//! Registry of hub actors, one per configured service.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::{HubActor, HubHandle, HubSettings, HubStatus, Subscription};
use crate::config::ServiceCatalog;
use crate::errors::HubError;
use crate::manager::ProcessManager;

/// The service set is fixed at startup, so so is the hub set.
pub struct HubRegistry {
    hubs: BTreeMap<String, HubHandle>,
}

impl HubRegistry {
    /// Spawn an idle hub for every service in the catalog.
    pub fn start(catalog: &ServiceCatalog, manager: Arc<dyn ProcessManager>, settings: HubSettings) -> Self {
        let hubs = catalog
            .iter()
            .map(|service| {
                let (handle, actor) = HubActor::create(service.clone(), manager.clone(), settings.clone());
                tokio::spawn(actor.run());
                (service.name.clone(), handle)
            })
            .collect::<BTreeMap<_, _>>();
        info!("Started {} log hub(s)", hubs.len());
        Self { hubs }
    }

    pub fn get(&self, service: &str) -> Option<&HubHandle> {
        self.hubs.get(service)
    }

    pub async fn subscribe(&self, service: &str) -> Result<Subscription, HubError> {
        self.get(service)
            .ok_or_else(|| HubError::ServiceNotFound(service.to_string()))?
            .subscribe()
            .await
    }

    /// Status of every hub that is still running, by service name.
    pub async fn statuses(&self) -> Vec<HubStatus> {
        let all = futures::future::join_all(self.hubs.values().map(|h| h.status())).await;
        all.into_iter().filter_map(|s| s.ok()).collect()
    }

    /// Shut every hub down in parallel.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.hubs.values().map(|h| h.shutdown())).await;
        info!("All log hubs stopped");
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }
}
