//! Supervisor unit: owns every entity unit of one type and routes to them.
//!
//! ## Phases
//!
//! - **Registering**: waits for the registry's address, then registers with a
//!   correlation id and a timeout. Failures retry with linear backoff; running
//!   out of retries stops the supervisor.
//! - **Initializing**: spawns the list unit and the accumulator, polls the list
//!   for known ids, and materializes one child per id. A list unit that dies
//!   before answering is restarted with the same backoff and retry bound as
//!   registration.
//! - **Ready**: routes commands by id, forwards list queries.
//!
//! Commands and queries that arrive before Ready are stashed and released in
//! arrival order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use steward_core::EntityId;
use steward_events::{
    Address, CommandEnvelope, CommandEventMessage, CommandMeta, CommandType, EntityState, EntityType,
    Recipient, Reply, RoutedCommand,
};

use crate::accumulator::{spawn_accumulator, AccumulatorHandle, AccumulatorMessage, ChildRefsRequest};
use crate::config::SupervisorConfig;
use crate::entity::{spawn_entity, EntityHandle, EntityMessage};
use crate::journal::Journal;
use crate::list::{spawn_list, ListHandle, ListItem, ListMessage};
use crate::registry::{InboundCommand, RegistryHandle, RegistryMessage, SupervisorRef};
use crate::unit::runtime::schedule;
use crate::unit::{Flow, Stash, Subscribed, UnitError};

pub enum SupervisorMessage<S: EntityState> {
    RegistryReady(RegistryHandle),
    Registered {
        correlation_id: Uuid,
        accepted: bool,
    },
    RegistrationTimeout {
        correlation_id: Uuid,
    },
    RetryRegistration,
    ListSnapshot {
        poll: u64,
        items: Vec<ListItem>,
    },
    PollList,
    Execute {
        command: S::Command,
        reply: Reply<CommandEventMessage>,
    },
    Submit(InboundCommand),
    IdGetList {
        reply: Reply<Vec<ListItem>>,
    },
    GetList {
        reply: Reply<Vec<S>>,
    },
    GetChildRefs(ChildRefsRequest<S>),
    SubscribeList {
        subscriber: Recipient<CommandEventMessage>,
        reply: Reply<Subscribed>,
    },
    Status {
        reply: Reply<SupervisorStatus>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorPhase {
    Registering,
    Initializing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub entity_type: EntityType,
    pub phase: SupervisorPhase,
    pub registration_attempts: u32,
    /// Every child id, live or passivated.
    pub children: Vec<EntityId>,
    pub stashed: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

pub struct SupervisorHandle<S: EntityState> {
    address: Address,
    sender: mpsc::UnboundedSender<SupervisorMessage<S>>,
}

impl<S: EntityState> Clone for SupervisorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            sender: self.sender.clone(),
        }
    }
}

impl<S: EntityState> core::fmt::Debug for SupervisorHandle<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("entity_type", &S::ENTITY_TYPE)
            .field("address", &self.address)
            .finish()
    }
}

impl<S: EntityState> SupervisorHandle<S> {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn tell(&self, message: SupervisorMessage<S>) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Tell the supervisor where the registry is; starts registration.
    pub fn registry_ready(&self, registry: RegistryHandle) -> bool {
        self.tell(SupervisorMessage::RegistryReady(registry))
    }

    pub async fn execute(&self, command: S::Command) -> Result<CommandEventMessage, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Execute {
                command,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    /// Route an untyped envelope from the bridge.
    pub async fn submit(
        &self,
        envelope: CommandEnvelope<JsonValue>,
    ) -> Result<CommandEventMessage, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Submit(InboundCommand {
                envelope,
                reply: tx.into(),
            }))
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub async fn id_list(&self) -> Result<Vec<ListItem>, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::IdGetList { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub async fn get_list(&self) -> Result<Vec<S>, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::GetList { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    /// Subscribe to the list unit's notifications.
    pub async fn subscribe_list(
        &self,
        subscriber: Recipient<CommandEventMessage>,
    ) -> Result<Subscribed, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::SubscribeList {
                subscriber,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub async fn status(&self) -> Result<SupervisorStatus, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Status { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    /// Poll until the supervisor reaches Ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), UnitError> {
        let ready = async {
            loop {
                if self.status().await?.phase == SupervisorPhase::Ready {
                    return Ok::<(), UnitError>(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| UnitError::Timeout)?
    }

    pub fn stop(&self) -> bool {
        self.tell(SupervisorMessage::Stop)
    }
}

pub fn spawn_supervisor<S: EntityState>(
    journal: Arc<dyn Journal>,
    config: SupervisorConfig,
) -> SupervisorHandle<S> {
    let (sender, inbox) = mpsc::unbounded_channel();
    let address = Address::new();
    let unit = Supervisor::<S> {
        address,
        inbox: sender.downgrade(),
        stash: Stash::new(config.unit.stash_capacity),
        journal,
        config,
        phase: SupervisorPhase::Registering,
        registry: None,
        attempts: 0,
        correlation_id: None,
        registration_timer: None,
        retry_timer: None,
        poll: 0,
        poll_timer: None,
        discovery_failures: 0,
        list: None,
        accumulator: None,
        children: BTreeMap::new(),
    };
    tokio::spawn(run(unit, inbox));
    SupervisorHandle { address, sender }
}

async fn run<S: EntityState>(
    mut unit: Supervisor<S>,
    mut inbox: mpsc::UnboundedReceiver<SupervisorMessage<S>>,
) {
    while let Some(message) = inbox.recv().await {
        if unit.handle(message) == Flow::Stop {
            break;
        }
    }
    unit.cancel_timers();
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit
// ─────────────────────────────────────────────────────────────────────────────

struct Supervisor<S: EntityState> {
    address: Address,
    inbox: mpsc::WeakUnboundedSender<SupervisorMessage<S>>,
    journal: Arc<dyn Journal>,
    config: SupervisorConfig,
    phase: SupervisorPhase,

    registry: Option<RegistryHandle>,
    attempts: u32,
    correlation_id: Option<Uuid>,
    registration_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,

    poll: u64,
    poll_timer: Option<JoinHandle<()>>,
    discovery_failures: u32,

    list: Option<ListHandle>,
    accumulator: Option<AccumulatorHandle<S>>,
    children: BTreeMap<EntityId, EntityHandle<S>>,
    stash: Stash<SupervisorMessage<S>>,
}

impl<S: EntityState> Supervisor<S> {
    fn recipient<M, F>(&self, wrap: F) -> Recipient<M>
    where
        M: Send + 'static,
        F: Fn(M) -> SupervisorMessage<S> + Send + Sync + 'static,
    {
        Recipient::from_weak(self.address, self.inbox.clone(), wrap)
    }

    fn unit_type(&self) -> String {
        format!("{}-supervisor", S::ENTITY_TYPE.stem())
    }

    fn handle(&mut self, message: SupervisorMessage<S>) -> Flow {
        match message {
            SupervisorMessage::RegistryReady(registry) => return self.registry_ready(registry),
            SupervisorMessage::Registered {
                correlation_id,
                accepted,
            } => return self.registered(correlation_id, accepted),
            SupervisorMessage::RegistrationTimeout { correlation_id } => {
                if self.is_current(correlation_id) {
                    return self.registration_failed("timed out");
                }
            }
            SupervisorMessage::RetryRegistration => {
                if self.phase == SupervisorPhase::Registering {
                    return self.register();
                }
            }
            SupervisorMessage::ListSnapshot { poll, items } => return self.list_snapshot(poll, items),
            SupervisorMessage::PollList => {
                if self.phase == SupervisorPhase::Initializing {
                    return self.poll_list();
                }
            }
            SupervisorMessage::Status { reply } => {
                reply.send(SupervisorStatus {
                    entity_type: S::ENTITY_TYPE,
                    phase: self.phase,
                    registration_attempts: self.attempts,
                    children: self.children.keys().copied().collect(),
                    stashed: self.stash.len(),
                });
            }
            SupervisorMessage::Stop => {
                self.shutdown();
                return Flow::Stop;
            }
            message if self.phase != SupervisorPhase::Ready => self.park(message),
            SupervisorMessage::Execute { command, reply } => self.route(command, reply),
            SupervisorMessage::Submit(inbound) => self.submit(inbound),
            SupervisorMessage::IdGetList { reply } => {
                if let Some(list) = &self.list {
                    list.tell(ListMessage::IdGetList { reply });
                }
            }
            SupervisorMessage::GetList { reply } => {
                if let Some(accumulator) = &self.accumulator {
                    accumulator.tell(AccumulatorMessage::GetList { reply });
                }
            }
            SupervisorMessage::GetChildRefs(request) => {
                let live = self
                    .children
                    .values()
                    .filter(|c| c.is_alive())
                    .cloned()
                    .collect();
                request.reply.send(live);
            }
            SupervisorMessage::SubscribeList { subscriber, reply } => {
                if let Some(list) = &self.list {
                    list.tell(ListMessage::Subscribe { subscriber, reply });
                }
            }
        }
        Flow::Continue
    }

    fn park(&mut self, message: SupervisorMessage<S>) {
        match self.stash.push(message) {
            Ok(()) => debug!(entity_type = %S::ENTITY_TYPE, stashed = self.stash.len(), "stashed"),
            Err(refused) => {
                debug!(entity_type = %S::ENTITY_TYPE, "stash full, refusing message");
                self.refuse(refused, "unit busy");
            }
        }
    }

    /// Answer a command with a failed event without routing it.
    fn refuse(&self, message: SupervisorMessage<S>, reason: &str) {
        match message {
            SupervisorMessage::Execute { command, reply } => {
                reply.send(self.failed(
                    command.command_type(),
                    command.target(),
                    command.meta(),
                    reason,
                    command.payload(),
                ));
            }
            SupervisorMessage::Submit(inbound) => {
                let envelope = inbound.envelope;
                inbound.reply.send(self.failed(
                    envelope.command_type,
                    envelope.id,
                    &envelope.meta,
                    reason,
                    envelope.payload.unwrap_or_default(),
                ));
            }
            _ => {}
        }
    }

    // ── Registering ─────────────────────────────────────────────────────────

    fn registry_ready(&mut self, registry: RegistryHandle) -> Flow {
        self.registry = Some(registry);
        if self.phase == SupervisorPhase::Registering {
            self.cancel_registration_timers();
            self.attempts = 0;
            return self.register();
        }

        // Already past registration: refresh the entry with the new registry.
        if let Some(registry) = &self.registry {
            let entry = RegistryMessage::Register {
                entity_type: S::ENTITY_TYPE,
                supervisor: self.supervisor_ref(),
                reply: Reply::Ignore,
            };
            registry.tell(entry);
        }
        Flow::Continue
    }

    fn supervisor_ref(&self) -> SupervisorRef {
        SupervisorRef {
            entity_type: S::ENTITY_TYPE,
            inbound: self.recipient(SupervisorMessage::Submit),
        }
    }

    fn register(&mut self) -> Flow {
        let Some(registry) = self.registry.clone() else {
            return Flow::Continue;
        };

        self.attempts += 1;
        let correlation_id = Uuid::now_v7();
        self.correlation_id = Some(correlation_id);
        info!(entity_type = %S::ENTITY_TYPE, attempt = self.attempts, "registering");

        let reply = Reply::To(self.recipient(move |accepted| SupervisorMessage::Registered {
            correlation_id,
            accepted,
        }));
        let sent = registry.tell(RegistryMessage::Register {
            entity_type: S::ENTITY_TYPE,
            supervisor: self.supervisor_ref(),
            reply,
        });
        if !sent {
            return self.registration_failed("registry unreachable");
        }

        self.registration_timer = Some(schedule(
            self.inbox.clone(),
            self.config.registration_timeout,
            SupervisorMessage::RegistrationTimeout { correlation_id },
        ));
        Flow::Continue
    }

    fn is_current(&self, correlation_id: Uuid) -> bool {
        self.phase == SupervisorPhase::Registering && self.correlation_id == Some(correlation_id)
    }

    fn registered(&mut self, correlation_id: Uuid, accepted: bool) -> Flow {
        if !self.is_current(correlation_id) {
            debug!(entity_type = %S::ENTITY_TYPE, "stale registration reply ignored");
            return Flow::Continue;
        }
        if !accepted {
            return self.registration_failed("registry refused");
        }

        self.cancel_registration_timers();
        self.correlation_id = None;
        info!(entity_type = %S::ENTITY_TYPE, attempt = self.attempts, "registered");
        self.start_initializing()
    }

    fn registration_failed(&mut self, reason: &str) -> Flow {
        self.cancel_registration_timers();
        self.correlation_id = None;

        let retries_used = self.attempts.saturating_sub(1);
        if retries_used >= self.config.registration_retries {
            error!(
                entity_type = %S::ENTITY_TYPE,
                attempts = self.attempts,
                reason,
                "registration failed, giving up"
            );
            self.shutdown();
            return Flow::Stop;
        }

        let delay = self.config.registration_backoff.delay(self.attempts);
        warn!(
            entity_type = %S::ENTITY_TYPE,
            attempt = self.attempts,
            reason,
            retry_in_ms = delay.as_millis() as u64,
            "registration failed, retrying"
        );
        self.retry_timer = Some(schedule(self.inbox.clone(), delay, SupervisorMessage::RetryRegistration));
        Flow::Continue
    }

    fn cancel_registration_timers(&mut self) {
        for timer in [self.registration_timer.take(), self.retry_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    // ── Initializing ────────────────────────────────────────────────────────

    fn start_initializing(&mut self) -> Flow {
        self.phase = SupervisorPhase::Initializing;

        let list = spawn_list(S::ENTITY_TYPE, self.journal.clone(), self.config.unit.clone());
        let accumulator = spawn_accumulator(
            self.recipient(SupervisorMessage::GetChildRefs),
            self.config.accumulator_pull_timeout,
            self.config.unit.stash_capacity,
        );
        self.list = Some(list);
        self.accumulator = Some(accumulator);

        self.poll_list()
    }

    fn poll_list(&mut self) -> Flow {
        let Some(list) = self.list.clone() else {
            return Flow::Continue;
        };
        if let Some(timer) = self.poll_timer.take() {
            timer.abort();
        }
        self.poll += 1;
        let poll = self.poll;

        let reply = Reply::To(self.recipient(move |items| SupervisorMessage::ListSnapshot { poll, items }));
        if !list.is_alive() || !list.tell(ListMessage::IdGetList { reply }) {
            return self.discovery_failed();
        }
        debug!(entity_type = %S::ENTITY_TYPE, poll, "polling id list");

        self.poll_timer = Some(schedule(
            self.inbox.clone(),
            self.config.list_poll_interval,
            SupervisorMessage::PollList,
        ));
        Flow::Continue
    }

    /// The list unit stopped before answering: restart it, or give up once
    /// the retries are spent.
    fn discovery_failed(&mut self) -> Flow {
        self.discovery_failures += 1;
        if self.discovery_failures > self.config.registration_retries {
            error!(
                entity_type = %S::ENTITY_TYPE,
                attempts = self.discovery_failures,
                "list unit keeps failing, giving up"
            );
            self.shutdown();
            return Flow::Stop;
        }

        let delay = self.config.registration_backoff.delay(self.discovery_failures);
        warn!(
            entity_type = %S::ENTITY_TYPE,
            attempt = self.discovery_failures,
            retry_in_ms = delay.as_millis() as u64,
            "list unit is gone, restarting it"
        );
        self.list = Some(spawn_list(S::ENTITY_TYPE, self.journal.clone(), self.config.unit.clone()));
        self.poll_timer = Some(schedule(self.inbox.clone(), delay, SupervisorMessage::PollList));
        Flow::Continue
    }

    fn list_snapshot(&mut self, poll: u64, items: Vec<ListItem>) -> Flow {
        if self.phase != SupervisorPhase::Initializing {
            debug!(entity_type = %S::ENTITY_TYPE, poll, "stale id list ignored");
            return Flow::Continue;
        }
        if let Some(timer) = self.poll_timer.take() {
            timer.abort();
        }

        for item in &items {
            self.materialize(item.id);
        }
        self.phase = SupervisorPhase::Ready;
        info!(entity_type = %S::ENTITY_TYPE, children = items.len(), poll, "supervisor ready");

        for message in self.stash.take_all() {
            if self.handle(message) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // ── Ready ───────────────────────────────────────────────────────────────

    /// Spawn the child for `id` and subscribe both read models to it.
    fn materialize(&mut self, id: EntityId) -> EntityHandle<S> {
        let child = spawn_entity::<S>(id, self.journal.clone(), self.config.unit.clone());
        let read_models = [
            self.list.as_ref().map(ListHandle::event_recipient),
            self.accumulator.as_ref().map(AccumulatorHandle::event_recipient),
        ];
        for subscriber in read_models.into_iter().flatten() {
            child.tell(EntityMessage::Subscribe {
                subscriber,
                reply: Reply::Ignore,
            });
        }
        self.children.insert(id, child.clone());
        child
    }

    /// The child for `id`, respawned if it passivated.
    fn live_child(&mut self, id: EntityId) -> Option<EntityHandle<S>> {
        match self.children.get(&id) {
            Some(child) if child.is_alive() => Some(child.clone()),
            Some(_) => {
                info!(entity_type = %S::ENTITY_TYPE, id = %id, "respawning passivated unit");
                Some(self.materialize(id))
            }
            None => None,
        }
    }

    fn route(&mut self, command: S::Command, reply: Reply<CommandEventMessage>) {
        let command_type = command.command_type();
        let stem = S::ENTITY_TYPE.stem();

        match command.target() {
            None if command_type == CommandType::Insert => {
                let id = EntityId::new();
                debug!(entity_type = %S::ENTITY_TYPE, id = %id, "allocated id");
                let child = self.materialize(id);
                self.forward(child, command.with_target(id), reply);
            }
            None => {
                reply.send(self.failed(
                    command_type,
                    None,
                    command.meta(),
                    format!("{stem} id cannot be empty"),
                    command.payload(),
                ));
            }
            Some(id) => match self.live_child(id) {
                Some(child) => self.forward(child, command, reply),
                None if matches!(command_type, CommandType::Insert | CommandType::Upsert) => {
                    let child = self.materialize(id);
                    self.forward(child, command, reply);
                }
                None => {
                    warn!(entity_type = %S::ENTITY_TYPE, id = %id, command = ?command_type, "no such child");
                    reply.send(self.failed(
                        command_type,
                        Some(id),
                        command.meta(),
                        format!("{stem} {id} not found"),
                        command.payload(),
                    ));
                }
            },
        }
    }

    fn forward(&mut self, child: EntityHandle<S>, command: S::Command, reply: Reply<CommandEventMessage>) {
        let Err(EntityMessage::Execute { command, reply }) =
            child.send(EntityMessage::Execute { command, reply })
        else {
            return;
        };

        // The child stopped between the liveness check and the send.
        let retry = self.materialize(child.id());
        if let Err(EntityMessage::Execute { command, reply }) =
            retry.send(EntityMessage::Execute { command, reply })
        {
            reply.send(self.failed(
                command.command_type(),
                command.target(),
                command.meta(),
                "unit unavailable",
                command.payload(),
            ));
        }
    }

    fn submit(&mut self, inbound: InboundCommand) {
        let InboundCommand { envelope, reply } = inbound;
        let (command_type, id, meta) = (envelope.command_type, envelope.id, envelope.meta.clone());

        match <S::Command as TryFrom<CommandEnvelope<JsonValue>>>::try_from(envelope) {
            Ok(command) => self.route(command, reply),
            Err(err) => {
                warn!(entity_type = %S::ENTITY_TYPE, error = %err, "envelope rejected");
                reply.send(self.failed(command_type, id, &meta, err.to_string(), JsonValue::Null));
            }
        }
    }

    fn failed(
        &self,
        command_type: CommandType,
        id: Option<EntityId>,
        meta: &CommandMeta,
        reason: impl Into<String>,
        payload: JsonValue,
    ) -> CommandEventMessage {
        CommandEventMessage::failed(S::ENTITY_TYPE, command_type, meta, reason)
            .emitted_by(self.unit_type())
            .for_entity(id, "")
            .with_payload(payload)
    }

    fn cancel_timers(&mut self) {
        self.cancel_registration_timers();
        if let Some(timer) = self.poll_timer.take() {
            timer.abort();
        }
    }

    fn shutdown(&mut self) {
        self.cancel_timers();
        for message in self.stash.take_all() {
            self.refuse(message, "supervisor stopped");
        }
        for child in self.children.values() {
            child.stop();
        }
        if let Some(list) = &self.list {
            list.stop();
        }
        if let Some(accumulator) = &self.accumulator {
            accumulator.stop();
        }
        info!(entity_type = %S::ENTITY_TYPE, children = self.children.len(), "supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use steward_clients::{ClientCommand, ClientState};
    use steward_events::Event;
    use steward_users::UserState;
    use tokio::time::Instant;

    use crate::config::UnitConfig;
    use crate::journal::{InMemoryJournal, PersistenceId};
    use crate::registry::spawn_registry;
    use crate::unit::LinearBackoff;

    fn meta() -> CommandMeta {
        CommandMeta::new("ann", "conn-1")
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig::default()
            .with_list_poll_interval(Duration::from_millis(50))
            .with_registration_timeout(Duration::from_secs(1))
    }

    async fn ready_clients(journal: Arc<dyn Journal>, config: SupervisorConfig) -> SupervisorHandle<ClientState> {
        let registry = spawn_registry();
        let supervisor = spawn_supervisor::<ClientState>(journal, config);
        supervisor.registry_ready(registry);
        supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();
        supervisor
    }

    #[tokio::test]
    async fn insert_update_delete_then_update_fails() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;

        let inserted = clients
            .execute(ClientCommand::insert(ClientState::named("Acme"), meta()))
            .await
            .unwrap();
        assert!(inserted.success);
        assert_eq!(inserted.payload["isActive"], true);
        let id = inserted.id.unwrap();

        let updated = clients
            .execute(ClientCommand::update(id, ClientState::named("Acme Corp"), meta()))
            .await
            .unwrap();
        assert!(updated.success);

        let deleted = clients.execute(ClientCommand::delete(id, meta())).await.unwrap();
        assert!(deleted.success);
        assert_eq!(deleted.payload["isActive"], false);

        let failed = clients
            .execute(ClientCommand::update(id, ClientState::named("Acme Corp 2"), meta()))
            .await
            .unwrap();
        assert!(failed.is_failure());
        assert_eq!(failed.command_type, CommandType::Update);
        assert!(failed.message.contains("inactive"));
    }

    #[tokio::test]
    async fn duplicate_insert_creates_one_child_and_one_rejection() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;
        let id = EntityId::new();

        let first = clients.execute(ClientCommand::insert(ClientState::named("Acme"), meta()).with_target(id));
        let second = clients.execute(ClientCommand::insert(ClientState::named("Acme"), meta()).with_target(id));
        let (first, second) = tokio::join!(first, second);

        let outcomes = [first.unwrap().success, second.unwrap().success];
        assert_eq!(outcomes.iter().filter(|s| **s).count(), 1);
        assert_eq!(clients.status().await.unwrap().children, vec![id]);
    }

    #[tokio::test]
    async fn missing_child_failure_is_typed_by_command() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;
        let id = EntityId::new();

        let update = clients
            .execute(ClientCommand::update(id, ClientState::named("Ghost"), meta()))
            .await
            .unwrap();
        assert_eq!(update.event_type(), "clients.client.update_failed");
        assert_eq!(update.id, Some(id));
        assert!(update.message.contains("not found"));

        let delete = clients.execute(ClientCommand::delete(id, meta())).await.unwrap();
        assert_eq!(delete.event_type(), "clients.client.delete_failed");
        assert!(clients.status().await.unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn upsert_with_new_id_creates_the_child() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;
        let id = EntityId::new();

        let event = clients
            .execute(ClientCommand::upsert(id, ClientState::named("Initech"), meta()))
            .await
            .unwrap();
        assert!(event.success);
        assert_eq!(event.id, Some(id));
    }

    #[tokio::test]
    async fn submit_maps_envelopes_and_reports_bad_ones() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;

        let envelope = CommandEnvelope::new(EntityType::Client, CommandType::Insert, meta())
            .with_payload(serde_json::json!({ "name": "Hooli" }));
        let inserted = clients.submit(envelope).await.unwrap();
        assert!(inserted.success);
        assert_eq!(inserted.display_name, "Hooli");

        let wrong_type = CommandEnvelope::new(EntityType::User, CommandType::Insert, meta())
            .with_payload(serde_json::json!({ "userName": "ann" }));
        let failed = clients.submit(wrong_type).await.unwrap();
        assert!(failed.is_failure());
        assert_eq!(failed.emitting_unit, "client-supervisor");

        let no_payload = CommandEnvelope::new(EntityType::Client, CommandType::Update, meta())
            .with_id(inserted.id.unwrap());
        assert!(clients.submit(no_payload).await.unwrap().is_failure());
    }

    #[tokio::test]
    async fn read_models_converge_and_survive_restart() {
        let journal: Arc<dyn Journal> = Arc::new(InMemoryJournal::new());
        let clients = ready_clients(journal.clone(), fast_config()).await;

        let mut ids = Vec::new();
        for name in ["Acme", "Globex", "Initech"] {
            let event = clients
                .execute(ClientCommand::insert(ClientState::named(name), meta()))
                .await
                .unwrap();
            ids.push(event.id.unwrap());
        }
        clients
            .execute(ClientCommand::update(ids[0], ClientState::named("Acme Corp"), meta()))
            .await
            .unwrap();
        clients.execute(ClientCommand::delete(ids[1], meta())).await.unwrap();

        // Both read models see every event eventually.
        let expected = vec![
            ("Acme Corp".to_string(), true),
            ("Globex".to_string(), false),
            ("Initech".to_string(), true),
        ];
        let mut converged = false;
        for _ in 0..100 {
            let mut listed: Vec<_> = clients
                .id_list()
                .await
                .unwrap()
                .into_iter()
                .map(|i| (i.display_name, i.is_active))
                .collect();
            listed.sort();
            let mut accumulated: Vec<_> = clients
                .get_list()
                .await
                .unwrap()
                .into_iter()
                .map(|s| (s.name, s.is_active))
                .collect();
            accumulated.sort();
            if listed == expected && accumulated == expected {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(converged);

        clients.stop();
        let restarted = ready_clients(journal, fast_config()).await;
        let mut children = restarted.status().await.unwrap().children;
        children.sort();
        ids.sort();
        assert_eq!(children, ids);

        let mut names: Vec<_> = restarted
            .get_list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        names.sort();
        assert_eq!(names, ["Acme Corp", "Globex", "Initech"]);
    }

    #[tokio::test]
    async fn list_subscribers_hear_about_new_entities() {
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), fast_config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ack = clients
            .subscribe_list(Recipient::from_sender(Address::new(), tx, |m: CommandEventMessage| m))
            .await
            .unwrap();
        assert_eq!(ack.unit_type, "client-list");
        assert_eq!(ack.persistence_id, "client-list");

        let inserted = clients
            .execute(ClientCommand::insert(ClientState::named("Acme"), meta()))
            .await
            .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(notice.success);
        assert_eq!(notice.id, inserted.id);
        assert_eq!(notice.display_name, "Acme");
        assert_eq!(notice.emitting_unit, "client-list");
    }

    #[tokio::test]
    async fn commands_before_ready_are_stashed() {
        let supervisor = spawn_supervisor::<UserState>(Arc::new(InMemoryJournal::new()), fast_config());
        let pending = tokio::spawn({
            let supervisor = supervisor.clone();
            async move {
                let envelope = CommandEnvelope::new(EntityType::User, CommandType::Insert, meta())
                    .with_payload(serde_json::json!({ "userName": "ann" }));
                supervisor.submit(envelope).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.status().await.unwrap().stashed, 1);

        supervisor.registry_ready(spawn_registry());
        let event = pending.await.unwrap().unwrap();
        assert!(event.success);
        assert_eq!(event.event_type(), "users.user.inserted");
    }

    #[tokio::test(start_paused = true)]
    async fn list_that_cannot_start_is_retried_then_fatal() {
        let journal = Arc::new(InMemoryJournal::new());
        journal
            .append(
                &PersistenceId::list(EntityType::Client),
                steward_core::ExpectedVersion::Exact(0),
                serde_json::json!({ "CommandClass": "ListArchiveCommand" }),
            )
            .unwrap();
        let config = SupervisorConfig::default()
            .with_list_poll_interval(Duration::from_secs(1))
            .with_registration_retries(2)
            .with_registration_backoff(LinearBackoff::new(Duration::from_secs(1), Duration::from_secs(60)))
            .with_unit(UnitConfig::default().with_strict_recovery(true));
        let supervisor = spawn_supervisor::<ClientState>(journal, config);

        let pending = tokio::spawn({
            let supervisor = supervisor.clone();
            async move {
                supervisor
                    .execute(ClientCommand::insert(ClientState::named("Acme"), meta()))
                    .await
            }
        });
        supervisor.registry_ready(spawn_registry());

        assert_eq!(
            supervisor.wait_ready(Duration::from_secs(60)).await.unwrap_err(),
            UnitError::Gone
        );
        assert!(!supervisor.is_alive());

        let refused = pending.await.unwrap().unwrap();
        assert!(refused.is_failure());
        assert_eq!(refused.event_type(), "clients.client.insert_failed");
        assert_eq!(refused.message, "supervisor stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn passivated_child_is_respawned_on_demand() {
        let config = fast_config().with_unit(
            UnitConfig::default().with_inactivity_flush(Duration::from_secs(30)),
        );
        let clients = ready_clients(Arc::new(InMemoryJournal::new()), config).await;
        let id = clients
            .execute(ClientCommand::insert(ClientState::named("Acme"), meta()))
            .await
            .unwrap()
            .id
            .unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;

        let updated = clients
            .execute(ClientCommand::update(id, ClientState::named("Acme Corp"), meta()))
            .await
            .unwrap();
        assert!(updated.success);
        assert_eq!(updated.display_name, "Acme Corp");
    }

    fn recording_registry(answer: Option<bool>) -> (RegistryHandle, Arc<Mutex<Vec<Instant>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let recipient = Recipient::from_fn(Address::new(), move |message: RegistryMessage| {
            if let RegistryMessage::Register { reply, .. } = message {
                seen.lock().unwrap().push(Instant::now());
                if let Some(accepted) = answer {
                    reply.send(accepted);
                }
            }
            true
        });
        (RegistryHandle::from_recipient(recipient), attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn registration_retries_are_bounded_with_growing_intervals() {
        let config = SupervisorConfig::default()
            .with_registration_timeout(Duration::from_secs(1))
            .with_registration_retries(3)
            .with_registration_backoff(LinearBackoff::new(Duration::from_secs(2), Duration::from_secs(60)));
        let supervisor = spawn_supervisor::<ClientState>(Arc::new(InMemoryJournal::new()), config);
        let (registry, attempts) = recording_registry(None);

        supervisor.registry_ready(registry);
        tokio::time::sleep(Duration::from_secs(120)).await;

        let attempts = attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<u64> = attempts.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, [3, 5, 7]);
        assert!(!supervisor.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_registration_is_retried_then_fatal() {
        let config = SupervisorConfig::default()
            .with_registration_retries(2)
            .with_registration_backoff(LinearBackoff::new(Duration::from_secs(1), Duration::from_secs(60)));
        let supervisor = spawn_supervisor::<ClientState>(Arc::new(InMemoryJournal::new()), config);
        let (registry, attempts) = recording_registry(Some(false));

        supervisor.registry_ready(registry);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(attempts.lock().unwrap().len(), 3);
        assert!(!supervisor.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn late_acceptance_after_retry_still_registers() {
        let config = SupervisorConfig::default()
            .with_registration_timeout(Duration::from_secs(1))
            .with_list_poll_interval(Duration::from_millis(50));
        let supervisor = spawn_supervisor::<ClientState>(Arc::new(InMemoryJournal::new()), config);

        // First attempt is swallowed, the second one is accepted.
        let counter = Arc::new(Mutex::new(0u32));
        let registry = RegistryHandle::from_recipient(Recipient::from_fn(
            Address::new(),
            move |message: RegistryMessage| {
                if let RegistryMessage::Register { reply, .. } = message {
                    let mut calls = counter.lock().unwrap();
                    *calls += 1;
                    if *calls > 1 {
                        reply.send(true);
                    }
                }
                true
            },
        ));

        supervisor.registry_ready(registry);
        supervisor.wait_ready(Duration::from_secs(60)).await.unwrap();
        assert_eq!(supervisor.status().await.unwrap().registration_attempts, 2);
    }
}
