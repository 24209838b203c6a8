//! Process-wide directory of supervisors, keyed by entity type.
//!
//! The registry is the single place the outside world goes to find the
//! supervisor for an entity type. It never inspects commands; it only hands
//! out [`SupervisorRef`]s.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use steward_events::{Address, CommandEnvelope, CommandEventMessage, EntityType, Recipient, Reply};

use crate::unit::UnitError;

/// An envelope from the bridge, on its way to a supervisor.
#[derive(Debug)]
pub struct InboundCommand {
    pub envelope: CommandEnvelope<JsonValue>,
    pub reply: Reply<CommandEventMessage>,
}

/// Type-erased address of a supervisor, as stored in the registry.
#[derive(Debug, Clone)]
pub struct SupervisorRef {
    pub entity_type: EntityType,
    pub inbound: Recipient<InboundCommand>,
}

impl SupervisorRef {
    pub fn address(&self) -> Address {
        self.inbound.address()
    }

    /// Route an inbound envelope and wait for the resulting event.
    pub async fn submit(
        &self,
        envelope: CommandEnvelope<JsonValue>,
    ) -> Result<CommandEventMessage, UnitError> {
        let (tx, rx) = oneshot::channel();
        if !self.inbound.tell(InboundCommand {
            envelope,
            reply: tx.into(),
        }) {
            return Err(UnitError::Gone);
        }
        Ok(rx.await?)
    }
}

#[derive(Debug)]
pub enum RegistryMessage {
    Register {
        entity_type: EntityType,
        supervisor: SupervisorRef,
        reply: Reply<bool>,
    },
    GetList {
        reply: Reply<BTreeMap<EntityType, SupervisorRef>>,
    },
    Lookup {
        entity_type: EntityType,
        reply: Reply<Option<SupervisorRef>>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct RegistryHandle {
    inbox: Recipient<RegistryMessage>,
}

impl RegistryHandle {
    /// Wrap any recipient of registry messages.
    pub fn from_recipient(inbox: Recipient<RegistryMessage>) -> Self {
        Self { inbox }
    }

    pub fn address(&self) -> Address {
        self.inbox.address()
    }

    pub fn tell(&self, message: RegistryMessage) -> bool {
        self.inbox.tell(message)
    }

    pub async fn register(
        &self,
        entity_type: EntityType,
        supervisor: SupervisorRef,
    ) -> Result<bool, UnitError> {
        let (tx, rx) = oneshot::channel();
        if !self.tell(RegistryMessage::Register {
            entity_type,
            supervisor,
            reply: tx.into(),
        }) {
            return Err(UnitError::Gone);
        }
        Ok(rx.await?)
    }

    pub async fn get_list(&self) -> Result<BTreeMap<EntityType, SupervisorRef>, UnitError> {
        let (tx, rx) = oneshot::channel();
        if !self.tell(RegistryMessage::GetList { reply: tx.into() }) {
            return Err(UnitError::Gone);
        }
        Ok(rx.await?)
    }

    pub async fn lookup(&self, entity_type: EntityType) -> Result<Option<SupervisorRef>, UnitError> {
        let (tx, rx) = oneshot::channel();
        if !self.tell(RegistryMessage::Lookup {
            entity_type,
            reply: tx.into(),
        }) {
            return Err(UnitError::Gone);
        }
        Ok(rx.await?)
    }

    pub fn stop(&self) -> bool {
        self.tell(RegistryMessage::Stop)
    }
}

pub fn spawn_registry() -> RegistryHandle {
    let (sender, inbox) = mpsc::unbounded_channel();
    let handle = RegistryHandle::from_recipient(Recipient::from_sender(Address::new(), sender, |m| m));
    tokio::spawn(run(inbox));
    handle
}

async fn run(mut inbox: mpsc::UnboundedReceiver<RegistryMessage>) {
    let mut supervisors: HashMap<EntityType, SupervisorRef> = HashMap::new();

    while let Some(message) = inbox.recv().await {
        match message {
            RegistryMessage::Register {
                entity_type,
                supervisor,
                reply,
            } => {
                let address = supervisor.address();
                match supervisors.insert(entity_type, supervisor) {
                    Some(previous) if previous.address() == address => {
                        debug!(entity_type = %entity_type, "supervisor re-registered");
                    }
                    _ => info!(entity_type = %entity_type, supervisor = %address, "supervisor registered"),
                }
                reply.send(true);
            }
            RegistryMessage::GetList { reply } => {
                reply.send(supervisors.iter().map(|(k, v)| (*k, v.clone())).collect());
            }
            RegistryMessage::Lookup { entity_type, reply } => {
                reply.send(supervisors.get(&entity_type).cloned());
            }
            RegistryMessage::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_ref(entity_type: EntityType) -> (SupervisorRef, mpsc::UnboundedReceiver<InboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SupervisorRef {
                entity_type,
                inbound: Recipient::from_sender(Address::new(), tx, |m| m),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn register_is_an_idempotent_upsert() {
        let registry = spawn_registry();
        let (clients, _rx1) = supervisor_ref(EntityType::Client);
        let (replacement, _rx2) = supervisor_ref(EntityType::Client);

        assert!(registry.register(EntityType::Client, clients.clone()).await.unwrap());
        assert!(registry.register(EntityType::Client, clients.clone()).await.unwrap());
        assert_eq!(registry.get_list().await.unwrap().len(), 1);

        assert!(registry.register(EntityType::Client, replacement.clone()).await.unwrap());
        let found = registry.lookup(EntityType::Client).await.unwrap().unwrap();
        assert_eq!(found.address(), replacement.address());
        assert!(registry.lookup(EntityType::User).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_list_returns_a_copy() {
        let registry = spawn_registry();
        let (clients, _rx1) = supervisor_ref(EntityType::Client);
        let (users, _rx2) = supervisor_ref(EntityType::User);
        registry.register(EntityType::Client, clients).await.unwrap();

        let mut snapshot = registry.get_list().await.unwrap();
        snapshot.insert(EntityType::User, users);

        assert_eq!(registry.get_list().await.unwrap().len(), 1);
        assert_eq!(
            registry.get_list().await.unwrap().keys().copied().collect::<Vec<_>>(),
            [EntityType::Client]
        );
    }

    #[tokio::test]
    async fn submit_reaches_the_supervisor_inbox() {
        let (supervisor, mut rx) = supervisor_ref(EntityType::User);
        let envelope = CommandEnvelope::new(
            EntityType::User,
            steward_events::CommandType::Insert,
            steward_events::CommandMeta::new("ann", "c1"),
        );

        let pending = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.submit(envelope).await }
        });
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.envelope.entity_type, EntityType::User);
        drop(inbound);
        assert_eq!(pending.await.unwrap().unwrap_err(), UnitError::Gone);
    }

    #[tokio::test]
    async fn stopped_registry_reports_gone() {
        let registry = spawn_registry();
        registry.stop();
        assert_eq!(registry.get_list().await.unwrap_err(), UnitError::Gone);
    }
}
