//! List unit: the persistent index of every entity a supervisor owns.
//!
//! Subscribed to each child entity, it turns their success events into list
//! commands, logs them, and answers id enumeration from memory. The supervisor
//! reads it once at startup to know which children to materialize.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use steward_core::{Aggregate, DomainError, EntityId};
use steward_events::{
    Address, CommandEventMessage, CommandMeta, CommandType, EntityType, LoggedCommand, Recipient,
    Reply, SubscriberSet,
};

use crate::config::{UnitConfig, UnitSetting};
use crate::journal::{Journal, PersistenceId};
use crate::unit::persistent::Persistent;
use crate::unit::runtime::{run_persistent, PersistentUnit};
use crate::unit::{Flow, Subscribed, UnitError, UnitStatus};

/// Summary of one entity as the index sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub id: EntityId,
    pub display_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListState {
    pub items: BTreeMap<EntityId, ListItem>,
}

impl ListState {
    pub fn contains(&self, id: EntityId) -> bool {
        self.items.contains_key(&id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "CommandClass")]
pub enum ListCommand {
    #[serde(rename = "ListInsertCommand")]
    Insert(ListItem),
    #[serde(rename = "ListUpdateCommand")]
    Update(ListItem),
    #[serde(rename = "ListDeleteCommand")]
    Delete { id: EntityId },
    #[serde(rename = "ListUndeleteCommand")]
    Undelete { id: EntityId },
}

impl ListCommand {
    pub fn id(&self) -> EntityId {
        match self {
            ListCommand::Insert(item) | ListCommand::Update(item) => item.id,
            ListCommand::Delete { id } | ListCommand::Undelete { id } => *id,
        }
    }

    /// Translate an entity's success event into the list command it implies.
    ///
    /// Failed events and events without an id yield `None`. An upsert becomes
    /// an insert or an update depending on whether `list` knows the id.
    pub fn from_event(event: &CommandEventMessage, list: &ListState) -> Option<Self> {
        if event.is_failure() {
            return None;
        }
        let id = event.id?;
        let item = || ListItem {
            id,
            display_name: event.display_name.clone(),
            is_active: event
                .payload
                .get("isActive")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true),
        };

        Some(match event.command_type {
            CommandType::Insert => ListCommand::Insert(item()),
            CommandType::Update => ListCommand::Update(item()),
            CommandType::Upsert if list.contains(id) => ListCommand::Update(item()),
            CommandType::Upsert => ListCommand::Insert(item()),
            CommandType::Delete => ListCommand::Delete { id },
            CommandType::Undelete => ListCommand::Undelete { id },
        })
    }

    fn command_type(&self) -> CommandType {
        match self {
            ListCommand::Insert(_) => CommandType::Insert,
            ListCommand::Update(_) => CommandType::Update,
            ListCommand::Delete { .. } => CommandType::Delete,
            ListCommand::Undelete { .. } => CommandType::Undelete,
        }
    }
}

impl LoggedCommand for ListCommand {
    const CLASSES: &'static [&'static str] = &[
        "ListInsertCommand",
        "ListUpdateCommand",
        "ListDeleteCommand",
        "ListUndeleteCommand",
    ];

    fn class(&self) -> &'static str {
        match self {
            ListCommand::Insert(_) => "ListInsertCommand",
            ListCommand::Update(_) => "ListUpdateCommand",
            ListCommand::Delete { .. } => "ListDeleteCommand",
            ListCommand::Undelete { .. } => "ListUndeleteCommand",
        }
    }
}

impl Aggregate for ListState {
    type Command = ListCommand;
    type Error = DomainError;

    fn apply(&mut self, command: &ListCommand) {
        match command {
            ListCommand::Insert(item) | ListCommand::Update(item) => {
                self.items.insert(item.id, item.clone());
            }
            ListCommand::Delete { id } => {
                if let Some(item) = self.items.get_mut(id) {
                    item.is_active = false;
                }
            }
            ListCommand::Undelete { id } => {
                if let Some(item) = self.items.get_mut(id) {
                    item.is_active = true;
                }
            }
        }
    }

    fn handle(&self, command: &ListCommand) -> Result<ListCommand, DomainError> {
        let id = command.id();
        match command {
            ListCommand::Insert(_) if self.contains(id) => {
                Err(DomainError::conflict(format!("{id} is already listed")))
            }
            ListCommand::Insert(_) => Ok(command.clone()),
            _ if !self.contains(id) => Err(DomainError::not_found(format!("{id} is not listed"))),
            _ => Ok(command.clone()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit
// ─────────────────────────────────────────────────────────────────────────────

pub enum ListMessage {
    /// An entity event to index.
    Event(CommandEventMessage),
    IdGetList {
        reply: Reply<Vec<ListItem>>,
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

#[derive(Debug, Clone)]
pub struct ListHandle {
    address: Address,
    sender: mpsc::UnboundedSender<ListMessage>,
}

impl ListHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn tell(&self, message: ListMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Where child entities deliver their events.
    pub fn event_recipient(&self) -> Recipient<CommandEventMessage> {
        Recipient::from_sender(self.address, self.sender.clone(), ListMessage::Event)
    }

    pub async fn id_list(&self) -> Result<Vec<ListItem>, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ListMessage::IdGetList { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub async fn subscribe(
        &self,
        subscriber: Recipient<CommandEventMessage>,
    ) -> Result<Subscribed, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ListMessage::Subscribe {
                subscriber,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub fn unsubscribe(&self, address: Address) -> bool {
        self.tell(ListMessage::Unsubscribe { address })
    }

    pub fn force_snapshot(&self) -> bool {
        self.tell(ListMessage::ForceSnapshot)
    }

    pub async fn configure(&self, setting: UnitSetting) -> Result<(), UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ListMessage::Configure {
                setting,
                reply: tx.into(),
            })
            .map_err(|_| UnitError::Gone)?;
        rx.await?
    }

    pub async fn status(&self) -> Result<UnitStatus, UnitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ListMessage::Status { reply: tx.into() })
            .map_err(|_| UnitError::Gone)?;
        Ok(rx.await?)
    }

    pub fn stop(&self) -> bool {
        self.tell(ListMessage::Stop)
    }
}

/// Spawn the list unit for `entity_type`, persisted as `<stem>-list`.
pub fn spawn_list(entity_type: EntityType, journal: Arc<dyn Journal>, config: UnitConfig) -> ListHandle {
    let (sender, inbox) = mpsc::unbounded_channel();
    let unit = ListUnit {
        entity_type,
        core: Persistent::new(PersistenceId::list(entity_type), journal, config),
        subscribers: SubscriberSet::new(),
    };
    tokio::spawn(run_persistent(unit, inbox));
    ListHandle {
        address: Address::new(),
        sender,
    }
}

struct ListUnit {
    entity_type: EntityType,
    core: Persistent<ListState>,
    subscribers: SubscriberSet<CommandEventMessage>,
}

impl ListUnit {
    fn unit_type(&self) -> String {
        format!("{}-list", self.entity_type.stem())
    }

    fn index(&mut self, event: CommandEventMessage) {
        let Some(command) = ListCommand::from_event(&event, &self.core.state) else {
            debug!(entity_type = %self.entity_type, "ignoring event without list effect");
            return;
        };

        let entry = match self.core.state.handle(&command) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    entity_type = %self.entity_type,
                    id = %command.id(),
                    command = command.class(),
                    reason = err.reason(),
                    "list command rejected"
                );
                return;
            }
        };

        if let Err(err) = self.core.persist(&entry) {
            error!(
                entity_type = %self.entity_type,
                id = %entry.id(),
                error = %err,
                "failed to persist list command"
            );
            return;
        }

        let item = self.core.state.items.get(&entry.id()).cloned();
        let (display_name, payload) = match item {
            Some(item) => (
                item.display_name.clone(),
                serde_json::to_value(&item).unwrap_or_default(),
            ),
            None => (String::new(), serde_json::Value::Null),
        };
        let notice = CommandEventMessage::succeeded(self.entity_type, entry.command_type(), &meta_of(&event))
            .emitted_by(self.unit_type())
            .for_entity(Some(entry.id()), display_name)
            .with_payload(payload);
        self.subscribers.publish(&notice);
    }
}

fn meta_of(event: &CommandEventMessage) -> CommandMeta {
    CommandMeta::new(event.acting_user.clone(), event.connection_id.clone())
}

impl PersistentUnit for ListUnit {
    type State = ListState;
    type Message = ListMessage;

    fn core(&mut self) -> &mut Persistent<ListState> {
        &mut self.core
    }

    fn handle(&mut self, message: ListMessage) -> Flow {
        match message {
            ListMessage::Event(event) => self.index(event),
            ListMessage::IdGetList { reply } => {
                reply.send(self.core.state.items.values().cloned().collect());
            }
            ListMessage::Subscribe { subscriber, reply } => {
                self.subscribers.subscribe(subscriber);
                reply.send(Subscribed {
                    unit_type: self.unit_type(),
                    persistence_id: self.core.persistence_id.to_string(),
                });
            }
            ListMessage::Unsubscribe { address } => {
                self.subscribers.unsubscribe(address);
            }
            ListMessage::ForceSnapshot => self.core.save_snapshot(),
            ListMessage::Configure { setting, reply } => {
                reply.send(self.core.persist_setting(setting).map_err(UnitError::from));
            }
            ListMessage::Status { reply } => {
                reply.send(self.core.status(self.subscribers.len(), 0));
            }
            ListMessage::Stop => return Flow::Stop,
        }
        Flow::Continue
    }

    fn refuse(&mut self, message: ListMessage) {
        if let ListMessage::Event(event) = message {
            warn!(
                entity_type = %self.entity_type,
                id = ?event.id,
                "list unit busy, event dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use steward_core::rehydrate;

    fn event(command_type: CommandType, id: EntityId, name: &str, active: bool) -> CommandEventMessage {
        CommandEventMessage::succeeded(EntityType::Client, command_type, &CommandMeta::new("ann", "c1"))
            .emitted_by("client-entity")
            .for_entity(Some(id), name)
            .with_payload(serde_json::json!({ "name": name, "isActive": active }))
    }

    #[test]
    fn events_map_to_list_commands() {
        let id = EntityId::new();
        let empty = ListState::default();

        assert!(matches!(
            ListCommand::from_event(&event(CommandType::Upsert, id, "Acme", true), &empty),
            Some(ListCommand::Insert(_))
        ));
        assert_eq!(
            ListCommand::from_event(&event(CommandType::Delete, id, "Acme", false), &empty),
            Some(ListCommand::Delete { id })
        );

        let failed = CommandEventMessage::failed(
            EntityType::Client,
            CommandType::Insert,
            &CommandMeta::new("ann", "c1"),
            "name is required",
        );
        assert_eq!(ListCommand::from_event(&failed, &empty), None);
    }

    #[test]
    fn insert_only_when_absent_and_others_only_when_present() {
        let id = EntityId::new();
        let item = ListItem {
            id,
            display_name: "Acme".to_string(),
            is_active: true,
        };
        let mut list = ListState::default();

        assert!(matches!(
            list.handle(&ListCommand::Delete { id }),
            Err(DomainError::NotFound(_))
        ));
        let entry = list.handle(&ListCommand::Insert(item.clone())).unwrap();
        list.apply(&entry);
        assert!(matches!(
            list.handle(&ListCommand::Insert(item)),
            Err(DomainError::Conflict(_))
        ));

        list.apply(&list.handle(&ListCommand::Delete { id }).unwrap());
        assert!(!list.items[&id].is_active);
    }

    #[test]
    fn list_commands_use_their_discriminators() {
        let value = serde_json::to_value(ListCommand::Undelete { id: EntityId::new() }).unwrap();
        assert_eq!(value["CommandClass"], "ListUndeleteCommand");
        for class in ListCommand::CLASSES {
            assert!(class.starts_with("List"));
        }
    }

    #[tokio::test]
    async fn indexes_events_and_survives_restart() {
        let journal: Arc<dyn Journal> = Arc::new(crate::journal::InMemoryJournal::new());
        let list = spawn_list(EntityType::Client, journal.clone(), UnitConfig::default());
        let (a, b) = (EntityId::new(), EntityId::new());

        let events = list.event_recipient();
        events.tell(event(CommandType::Insert, a, "Acme", true));
        events.tell(event(CommandType::Insert, b, "Globex", true));
        events.tell(event(CommandType::Update, a, "Acme Corp", true));
        events.tell(event(CommandType::Delete, b, "Globex", false));
        // Duplicate delivery is rejected, not double-applied.
        events.tell(event(CommandType::Insert, a, "Acme", true));

        let items = list.id_list().await.unwrap();
        assert_eq!(items.len(), 2);
        let acme = items.iter().find(|i| i.id == a).unwrap();
        assert_eq!(acme.display_name, "Acme Corp");
        assert!(!items.iter().find(|i| i.id == b).unwrap().is_active);
        assert_eq!(list.status().await.unwrap().sequence_nr, 4);
        list.stop();

        let again = spawn_list(EntityType::Client, journal, UnitConfig::default());
        let mut recovered = again.id_list().await.unwrap();
        let mut expected = items;
        recovered.sort_by_key(|i| i.id);
        expected.sort_by_key(|i| i.id);
        assert_eq!(recovered, expected);
    }

    #[tokio::test]
    async fn notifies_its_own_subscribers() {
        let list = spawn_list(
            EntityType::User,
            Arc::new(crate::journal::InMemoryJournal::new()),
            UnitConfig::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ack = list
            .subscribe(Recipient::from_sender(Address::new(), tx, |m: CommandEventMessage| m))
            .await
            .unwrap();
        assert_eq!(ack.persistence_id, "user-list");

        let id = EntityId::new();
        list.event_recipient().tell(event(CommandType::Insert, id, "ann", true));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.emitting_unit, "user-list");
        assert_eq!(notice.id, Some(id));
        assert_eq!(notice.payload["displayName"], "ann");
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn index_converges_to_entity_summaries(ops in prop::collection::vec((0usize..4, 0u8..4, any::<bool>()), 1..40)) {
            let ids: Vec<EntityId> = (0..4).map(|_| EntityId::new()).collect();
            let mut truth: BTreeMap<EntityId, (String, bool)> = BTreeMap::new();
            let mut list = ListState::default();

            for (slot, op, flag) in ops {
                let id = ids[slot];
                let name = format!("n{slot}-{op}");
                let present = truth.contains_key(&id);
                let ev = match (op, present) {
                    (_, false) => event(CommandType::Insert, id, &name, true),
                    (0, true) => event(CommandType::Update, id, &name, truth[&id].1),
                    (1, true) => event(CommandType::Upsert, id, &name, truth[&id].1),
                    (_, true) if flag => event(CommandType::Delete, id, &truth[&id].0.clone(), false),
                    _ => event(CommandType::Undelete, id, &truth[&id].0.clone(), true),
                };
                truth.insert(id, (ev.display_name.clone(), ev.payload["isActive"].as_bool().unwrap()));

                let command = ListCommand::from_event(&ev, &list).unwrap();
                let entry = list.handle(&command).unwrap();
                list.apply(&entry);
            }

            let indexed: BTreeMap<EntityId, (String, bool)> = list
                .items
                .values()
                .map(|i| (i.id, (i.display_name.clone(), i.is_active)))
                .collect();
            prop_assert_eq!(indexed, truth);
        }

        #[test]
        fn replay_matches_live_index(names in prop::collection::vec("[a-z]{1,6}", 1..20)) {
            let mut live = ListState::default();
            let mut log = Vec::new();
            for name in names {
                let item = ListItem { id: EntityId::new(), display_name: name, is_active: true };
                let entry = live.handle(&ListCommand::Insert(item)).unwrap();
                live.apply(&entry);
                log.push(entry);
            }
            prop_assert_eq!(rehydrate(ListState::default(), &log), live);
        }
    }
}
