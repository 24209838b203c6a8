//! Process wiring: one registry, one supervisor per entity type.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use steward_clients::ClientState;
use steward_events::EntityType;
use steward_users::UserState;

use crate::config::SystemConfig;
use crate::journal::Journal;
use crate::registry::{spawn_registry, RegistryHandle};
use crate::supervisor::{spawn_supervisor, SupervisorHandle};
use crate::unit::UnitError;

/// Handles to every top-level unit of a running system.
#[derive(Debug, Clone)]
pub struct System {
    registry: RegistryHandle,
    clients: SupervisorHandle<ClientState>,
    users: SupervisorHandle<UserState>,
}

impl System {
    /// Spawn the registry, then the supervisors, then tell each supervisor
    /// where the registry is.
    ///
    /// Returns as soon as everything is spawned. Use [`System::wait_ready`] to
    /// wait for registration and initialization.
    pub fn boot(config: SystemConfig, journal: Arc<dyn Journal>) -> Self {
        let registry = spawn_registry();
        let clients = spawn_supervisor::<ClientState>(journal.clone(), config.supervisor.clone());
        let users = spawn_supervisor::<UserState>(journal, config.supervisor);

        clients.registry_ready(registry.clone());
        users.registry_ready(registry.clone());
        info!(entity_types = EntityType::ALL.len(), "system booted");

        Self {
            registry,
            clients,
            users,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn clients(&self) -> &SupervisorHandle<ClientState> {
        &self.clients
    }

    pub fn users(&self) -> &SupervisorHandle<UserState> {
        &self.users
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), UnitError> {
        self.clients.wait_ready(timeout).await?;
        self.users.wait_ready(timeout).await
    }

    /// Stop the supervisors (which stop their children) and the registry.
    pub fn shutdown(&self) {
        self.clients.stop();
        self.users.stop();
        self.registry.stop();
        info!("system shut down");
    }
}
