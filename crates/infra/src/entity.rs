//! Entity unit: one persistent, single-writer unit per business record.
//!
//! ## Command flow
//!
//! 1. `handle` validates the command against the current state
//! 2. On rejection: reply with a failed event (nothing is logged)
//! 3. Append the normalized entry to the unit's log
//! 4. Apply it to state (only after the append succeeded)
//! 5. Publish the success event to subscribers, then reply to the caller
//! 6. Snapshot every N commands, or right away for lifecycle changes
//!
//! Messages that arrive during recovery are stashed and replayed in order.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use steward_core::EntityId;
use steward_events::{
    Address, CommandEventMessage, CommandMeta, CommandType, EntityState, LoggedCommand, Recipient,
    Reply, RoutedCommand, SubscriberSet,
};

use crate::config::{UnitConfig, UnitSetting};
use crate::journal::{Journal, PersistenceId};
use crate::unit::persistent::Persistent;
use crate::unit::runtime::{run_persistent, PersistentUnit};
use crate::unit::{Flow, Subscribed, UnitError, UnitStatus};

/// Answer to a state pull.
#[derive(Debug, Clone, PartialEq)]
pub struct StateReply<S> {
    /// Address of the unit that answered.
    pub from: Address,
    pub id: EntityId,
    /// `None` until the entity has been inserted.
    pub state: Option<S>,
}

/// Inbox of an entity unit.
pub enum EntityMessage<S: EntityState> {
    Execute {
        command: S::Command,
        reply: Reply<CommandEventMessage>,
    },
    GetState {
        reply: Reply<StateReply<S>>,
    },
    Subscribe {
        subscriber: Recipient<CommandEventMessage>,
        reply: Reply<Subscribed>,
    },
    Unsubscribe {
        address: Address,
    },
    ForceSnapshot,
    Configure {
        setting: UnitSetting,
        reply: Reply<Result<(), UnitError>>,
    },
    Status {
        reply: Reply<UnitStatus>,
    },
    Stop,
}

impl<S: EntityState> core::fmt::Debug for EntityMessage<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            EntityMessage::Execute { .. } => "Execute",
            EntityMessage::GetState { .. } => "GetState",
            EntityMessage::Subscribe { .. } => "Subscribe",
            EntityMessage::Unsubscribe { .. } => "Unsubscribe",
            EntityMessage::ForceSnapshot => "ForceSnapshot",
            EntityMessage::Configure { .. } => "Configure",
            EntityMessage::Status { .. } => "Status",
            EntityMessage::Stop => "Stop",
        };
        f.write_str(name)
    }
}

/// Name entity units of type `S` use in events and acknowledgements.
pub fn entity_unit_type<S: EntityState>() -> String {
    format!("{}-entity", S::ENTITY_TYPE.stem())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable address of a running entity unit.
pub struct EntityHandle<S: EntityState> {
    id: EntityId,
    address: Address,
    sender: mpsc::UnboundedSender<EntityMessage<S>>,
}

impl<S: EntityState> Clone for EntityHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            address: self.address,
            sender: self.sender.clone(),
        }
    }
}

impl<S: EntityState> core::fmt::Debug for EntityHandle<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<S: EntityState> EntityHandle<S> {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the unit's task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Fire-and-forget. Returns `false` if the unit is gone.
    pub fn tell(&self, message: EntityMessage<S>) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Like [`EntityHandle::tell`], but hands the message back if the unit is gone.
    pub(crate) fn send(&self, message: EntityMessage<S>) -> Result<(), EntityMessage<S>> {
        self.sender.send(message).map_err(|e| e.0)
    }

    pub async fn execute(&self, command: S::Command) -> Result<CommandEventMessage, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::Execute {
                command,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    /// Current state, `None` if the entity was never inserted.
    pub async fn state(&self) -> Result<Option<S>, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::GetState { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?.state)
    }

    pub async fn subscribe(
        &self,
        subscriber: Recipient<CommandEventMessage>,
    ) -> Result<Subscribed, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::Subscribe {
                subscriber,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub fn unsubscribe(&self, address: Address) -> bool {
        self.tell(EntityMessage::Unsubscribe { address })
    }

    pub fn force_snapshot(&self) -> bool {
        self.tell(EntityMessage::ForceSnapshot)
    }

    /// Log and apply a runtime setting.
    pub async fn configure(&self, setting: UnitSetting) -> Result<(), UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::Configure {
                setting,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        rx.await?
    }

    pub async fn status(&self) -> Result<UnitStatus, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::Status { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub fn stop(&self) -> bool {
        self.tell(EntityMessage::Stop)
    }

    /// A handle with no unit behind it; the test holds the inbox.
    #[cfg(test)]
    pub(crate) fn detached(id: EntityId) -> (Self, mpsc::UnboundedReceiver<EntityMessage<S>>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        (
            Self {
                id,
                address: Address::new(),
                sender,
            },
            inbox,
        )
    }
}

/// Spawn an entity unit for `id`. It recovers from `journal` before handling
/// any message.
pub fn spawn_entity<S: EntityState>(
    id: EntityId,
    journal: Arc<dyn Journal>,
    config: UnitConfig,
) -> EntityHandle<S> {
    let (sender, inbox) = mpsc::unbounded_channel();
    let address = Address::new();
    let unit = EntityUnit::<S> {
        id,
        address,
        core: Persistent::new(PersistenceId::entity(S::ENTITY_TYPE, id), journal, config),
        subscribers: SubscriberSet::new(),
    };
    tokio::spawn(run_persistent(unit, inbox));
    EntityHandle {
        id,
        address,
        sender,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit
// ─────────────────────────────────────────────────────────────────────────────

struct EntityUnit<S: EntityState> {
    id: EntityId,
    address: Address,
    core: Persistent<S>,
    subscribers: SubscriberSet<CommandEventMessage>,
}

impl<S: EntityState> EntityUnit<S> {
    fn execute(&mut self, command: S::Command, reply: Reply<CommandEventMessage>) {
        let command_type = command.command_type();
        let command = match command.target() {
            None => command.with_target(self.id),
            Some(target) if target == self.id => command,
            Some(target) => {
                warn!(
                    entity_type = %S::ENTITY_TYPE,
                    id = %self.id,
                    target = %target,
                    command = command.class(),
                    "command addressed to another entity"
                );
                reply.send(self.failed(
                    command_type,
                    command.meta(),
                    format!("{} {target} is not handled by unit {}", S::ENTITY_TYPE.stem(), self.id),
                    command.payload(),
                ));
                return;
            }
        };

        let entry = match self.core.state.handle(&command) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    entity_type = %S::ENTITY_TYPE,
                    id = %self.id,
                    command = command.class(),
                    reason = err.reason(),
                    "command rejected"
                );
                reply.send(self.failed(command_type, command.meta(), err.reason(), command.payload()));
                return;
            }
        };

        if let Err(err) = self.core.persist(&entry) {
            error!(
                entity_type = %S::ENTITY_TYPE,
                id = %self.id,
                command = entry.class(),
                error = %err,
                "failed to persist command"
            );
            reply.send(self.failed(
                command_type,
                command.meta(),
                format!("persistence failure: {err}"),
                command.payload(),
            ));
            return;
        }

        let event = CommandEventMessage::succeeded(S::ENTITY_TYPE, command_type, entry.meta())
            .emitted_by(entity_unit_type::<S>())
            .for_entity(Some(self.id), self.core.state.display_name())
            .with_payload(self.state_json());

        let delivered = self.subscribers.publish(&event);
        debug!(
            entity_type = %S::ENTITY_TYPE,
            id = %self.id,
            sequence_nr = self.core.sequence_nr(),
            delivered,
            "command applied"
        );
        reply.send(event);
    }

    fn failed(
        &self,
        command_type: CommandType,
        meta: &CommandMeta,
        reason: impl Into<String>,
        payload: JsonValue,
    ) -> CommandEventMessage {
        let display_name = self.core.state.display_name().to_string();
        CommandEventMessage::failed(S::ENTITY_TYPE, command_type, meta, reason)
            .emitted_by(entity_unit_type::<S>())
            .for_entity(Some(self.id), display_name)
            .with_payload(payload)
    }

    fn state_json(&self) -> JsonValue {
        serde_json::to_value(&self.core.state).unwrap_or_else(|err| {
            error!(id = %self.id, error = %err, "failed to serialize state");
            JsonValue::Null
        })
    }

    fn current_state(&self) -> Option<S> {
        self.core
            .state
            .entity_id()
            .is_some()
            .then(|| self.core.state.clone())
    }
}

impl<S: EntityState> PersistentUnit for EntityUnit<S> {
    type State = S;
    type Message = EntityMessage<S>;

    fn core(&mut self) -> &mut Persistent<S> {
        &mut self.core
    }

    fn handle(&mut self, message: EntityMessage<S>) -> Flow {
        match message {
            EntityMessage::Execute { command, reply } => self.execute(command, reply),
            EntityMessage::GetState { reply } => {
                reply.send(StateReply {
                    from: self.address,
                    id: self.id,
                    state: self.current_state(),
                });
            }
            EntityMessage::Subscribe { subscriber, reply } => {
                let address = subscriber.address();
                if self.subscribers.subscribe(subscriber) {
                    debug!(id = %self.id, subscriber = %address, "subscribed");
                }
                reply.send(Subscribed {
                    unit_type: entity_unit_type::<S>(),
                    persistence_id: self.core.persistence_id.to_string(),
                });
            }
            EntityMessage::Unsubscribe { address } => {
                self.subscribers.unsubscribe(address);
            }
            EntityMessage::ForceSnapshot => self.core.save_snapshot(),
            EntityMessage::Configure { setting, reply } => {
                reply.send(self.core.persist_setting(setting).map_err(UnitError::from));
            }
            EntityMessage::Status { reply } => {
                reply.send(self.core.status(self.subscribers.len(), 0));
            }
            EntityMessage::Stop => return Flow::Stop,
        }
        Flow::Continue
    }

    fn refuse(&mut self, message: EntityMessage<S>) {
        if let EntityMessage::Execute { command, reply } = message {
            reply.send(self.failed(
                command.command_type(),
                command.meta(),
                "unit busy",
                command.payload(),
            ));
        }
    }

    fn on_idle(&mut self) -> Flow {
        info!(entity_type = %S::ENTITY_TYPE, id = %self.id, "passivating idle unit");
        Flow::Stop
    }

    fn on_passivate(&mut self) {
        if self.core.is_dirty() {
            self.core.save_snapshot();
        }
    }
}
