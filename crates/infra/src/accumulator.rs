//! Accumulator unit: an in-memory map of every child's full state.
//!
//! Not persisted. On start it asks its parent supervisor for the live child
//! handles, pulls each child's state, and only then serves reads. While Ready
//! it keeps itself current from the children's success events, last arrival
//! wins. Dropping it loses nothing; a new one rebuilds the same way.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use steward_core::EntityId;
use steward_events::{Address, CommandEventMessage, EntityState, Recipient, Reply};

use crate::entity::{EntityHandle, EntityMessage, StateReply};
use crate::unit::runtime::schedule;
use crate::unit::{Flow, Stash, UnitError};

/// Request for the live child handles of a supervisor.
pub struct ChildRefsRequest<S: EntityState> {
    pub reply: Reply<Vec<EntityHandle<S>>>,
}

pub enum AccumulatorMessage<S: EntityState> {
    ChildRefs(Vec<EntityHandle<S>>),
    State(StateReply<S>),
    PullTimeout,
    Event(CommandEventMessage),
    GetList { reply: Reply<Vec<S>> },
    Status { reply: Reply<AccumulatorStatus> },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccumulatorPhase {
    Initializing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccumulatorStatus {
    pub phase: AccumulatorPhase,
    /// Children known, including those not inserted yet.
    pub children: usize,
    pub pending: usize,
    pub stashed: usize,
}

pub struct AccumulatorHandle<S: EntityState> {
    address: Address,
    sender: mpsc::UnboundedSender<AccumulatorMessage<S>>,
}

impl<S: EntityState> Clone for AccumulatorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            sender: self.sender.clone(),
        }
    }
}

impl<S: EntityState> AccumulatorHandle<S> {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn tell(&self, message: AccumulatorMessage<S>) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Where child entities deliver their events.
    pub fn event_recipient(&self) -> Recipient<CommandEventMessage> {
        Recipient::from_sender(self.address, self.sender.clone(), AccumulatorMessage::Event)
    }

    /// Full state of every inserted child. Waits until the accumulator is Ready.
    pub async fn get_list(&self) -> Result<Vec<S>, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AccumulatorMessage::GetList { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub async fn status(&self) -> Result<AccumulatorStatus, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AccumulatorMessage::Status { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub fn stop(&self) -> bool {
        self.tell(AccumulatorMessage::Stop)
    }
}

/// Spawn an accumulator that discovers its children through `parent`.
pub fn spawn_accumulator<S: EntityState>(
    parent: Recipient<ChildRefsRequest<S>>,
    pull_timeout: Duration,
    stash_capacity: Option<usize>,
) -> AccumulatorHandle<S> {
    let (sender, inbox) = mpsc::unbounded_channel();
    let address = Address::new();
    let unit = Accumulator {
        address,
        inbox: sender.downgrade(),
        parent,
        pull_timeout,
        phase: AccumulatorPhase::Initializing,
        entries: BTreeMap::new(),
        pending: HashMap::new(),
        pull_timer: None,
        stash: Stash::new(stash_capacity),
    };
    tokio::spawn(run(unit, inbox));
    AccumulatorHandle { address, sender }
}

async fn run<S: EntityState>(
    mut unit: Accumulator<S>,
    mut inbox: mpsc::UnboundedReceiver<AccumulatorMessage<S>>,
) {
    if unit.start() == Flow::Stop {
        return;
    }
    while let Some(message) = inbox.recv().await {
        if unit.handle(message) == Flow::Stop {
            break;
        }
    }
    if let Some(timer) = unit.pull_timer.take() {
        timer.abort();
    }
}

struct Accumulator<S: EntityState> {
    address: Address,
    inbox: mpsc::WeakUnboundedSender<AccumulatorMessage<S>>,
    parent: Recipient<ChildRefsRequest<S>>,
    pull_timeout: Duration,
    phase: AccumulatorPhase,
    entries: BTreeMap<EntityId, Option<S>>,
    pending: HashMap<Address, EntityId>,
    pull_timer: Option<JoinHandle<()>>,
    stash: Stash<AccumulatorMessage<S>>,
}

impl<S: EntityState> Accumulator<S> {
    fn recipient<M, F>(&self, wrap: F) -> Recipient<M>
    where
        M: Send + 'static,
        F: Fn(M) -> AccumulatorMessage<S> + Send + Sync + 'static,
    {
        Recipient::from_weak(self.address, self.inbox.clone(), wrap)
    }

    fn start(&mut self) -> Flow {
        let request = ChildRefsRequest {
            reply: Reply::To(self.recipient(AccumulatorMessage::ChildRefs)),
        };
        if self.parent.tell(request) {
            Flow::Continue
        } else {
            warn!(entity_type = %S::ENTITY_TYPE, "parent is gone, accumulator stopping");
            Flow::Stop
        }
    }

    fn handle(&mut self, message: AccumulatorMessage<S>) -> Flow {
        match message {
            AccumulatorMessage::ChildRefs(children) => self.pull(children),
            AccumulatorMessage::State(reply) => self.record(reply),
            AccumulatorMessage::PullTimeout => {
                if self.phase == AccumulatorPhase::Initializing {
                    warn!(
                        entity_type = %S::ENTITY_TYPE,
                        unanswered = self.pending.len(),
                        "state pull timed out"
                    );
                    self.pending.clear();
                    self.become_ready();
                }
            }
            AccumulatorMessage::Status { reply } => {
                reply.send(AccumulatorStatus {
                    phase: self.phase,
                    children: self.entries.len(),
                    pending: self.pending.len(),
                    stashed: self.stash.len(),
                });
            }
            AccumulatorMessage::Stop => return Flow::Stop,
            message if self.phase == AccumulatorPhase::Initializing => {
                if self.stash.push(message).is_err() {
                    debug!(entity_type = %S::ENTITY_TYPE, "stash full, refusing message");
                } else {
                    debug!(entity_type = %S::ENTITY_TYPE, stashed = self.stash.len(), "stashed");
                }
            }
            AccumulatorMessage::Event(event) => self.upsert(event),
            AccumulatorMessage::GetList { reply } => {
                reply.send(self.entries.values().flatten().cloned().collect());
            }
        }
        Flow::Continue
    }

    fn pull(&mut self, children: Vec<EntityHandle<S>>) {
        if self.phase == AccumulatorPhase::Ready {
            debug!(entity_type = %S::ENTITY_TYPE, "late child list ignored");
            return;
        }

        for child in children {
            let reply = Reply::To(self.recipient(AccumulatorMessage::State));
            if child.tell(EntityMessage::GetState { reply }) {
                self.pending.insert(child.address(), child.id());
            } else {
                debug!(entity_type = %S::ENTITY_TYPE, id = %child.id(), "child gone before pull");
            }
        }

        if self.pending.is_empty() {
            self.become_ready();
        } else {
            self.pull_timer = Some(schedule(
                self.inbox.clone(),
                self.pull_timeout,
                AccumulatorMessage::PullTimeout,
            ));
        }
    }

    fn record(&mut self, reply: StateReply<S>) {
        if self.pending.remove(&reply.from).is_none() {
            debug!(entity_type = %S::ENTITY_TYPE, id = %reply.id, "unexpected state reply");
            return;
        }
        self.entries.insert(reply.id, reply.state);
        if self.phase == AccumulatorPhase::Initializing && self.pending.is_empty() {
            self.become_ready();
        }
    }

    fn become_ready(&mut self) {
        if let Some(timer) = self.pull_timer.take() {
            timer.abort();
        }
        self.phase = AccumulatorPhase::Ready;
        info!(entity_type = %S::ENTITY_TYPE, children = self.entries.len(), "accumulator ready");

        for message in self.stash.take_all() {
            self.handle(message);
        }
    }

    fn upsert(&mut self, event: CommandEventMessage) {
        let Some(id) = event.id else { return };
        if event.is_failure() || event.entity_type != S::ENTITY_TYPE {
            return;
        }
        match event.payload_as::<S>() {
            Ok(state) => {
                self.entries.insert(id, Some(state));
            }
            Err(err) => {
                warn!(entity_type = %S::ENTITY_TYPE, id = %id, error = %err, "undecodable event payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use steward_clients::{ClientCommand, ClientState};
    use steward_events::{CommandMeta, RoutedCommand};

    use crate::config::UnitConfig;
    use crate::entity::spawn_entity;
    use crate::journal::InMemoryJournal;

    fn meta() -> CommandMeta {
        CommandMeta::new("ann", "c1")
    }

    fn parent_of(children: Vec<EntityHandle<ClientState>>) -> Recipient<ChildRefsRequest<ClientState>> {
        Recipient::from_fn(Address::new(), move |request: ChildRefsRequest<ClientState>| {
            request.reply.send(children.clone())
        })
    }

    async fn inserted(name: &str) -> EntityHandle<ClientState> {
        let id = EntityId::new();
        let child = spawn_entity(id, Arc::new(InMemoryJournal::new()), UnitConfig::default());
        child
            .execute(ClientCommand::insert(ClientState::named(name), meta()).with_target(id))
            .await
            .unwrap();
        child
    }

    #[tokio::test]
    async fn pulls_every_child_before_serving() {
        let acme = inserted("Acme").await;
        let globex = inserted("Globex").await;
        let fresh: EntityHandle<ClientState> =
            spawn_entity(EntityId::new(), Arc::new(InMemoryJournal::new()), UnitConfig::default());

        let acc = spawn_accumulator(
            parent_of(vec![acme.clone(), globex, fresh]),
            Duration::from_secs(10),
            None,
        );

        let mut names: Vec<_> = acc.get_list().await.unwrap().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, ["Acme", "Globex"]);

        let status = acc.status().await.unwrap();
        assert_eq!(status.phase, AccumulatorPhase::Ready);
        assert_eq!(status.children, 3);

        // Events keep it current.
        acme.subscribe(acc.event_recipient()).await.unwrap();
        acme.execute(ClientCommand::update(acme.id(), ClientState::named("Acme Corp"), meta()))
            .await
            .unwrap();
        let names: Vec<_> = acc.get_list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"Acme Corp".to_string()));
    }

    #[tokio::test]
    async fn no_children_is_ready_at_once() {
        let acc = spawn_accumulator::<ClientState>(parent_of(Vec::new()), Duration::from_secs(10), None);
        assert!(acc.get_list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_child_is_dropped_after_timeout() {
        let acme = inserted("Acme").await;
        let (silent, _inbox) = EntityHandle::<ClientState>::detached(EntityId::new());

        let acc = spawn_accumulator(parent_of(vec![acme, silent]), Duration::from_secs(3), None);

        let list = acc.get_list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(acc.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn stops_when_parent_is_gone() {
        let parent = Recipient::from_fn(Address::new(), |_: ChildRefsRequest<ClientState>| false);
        let acc = spawn_accumulator(parent, Duration::from_secs(1), None);
        assert_eq!(acc.get_list().await.unwrap_err(), UnitError::Gone);
    }
}
