use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use steward_core::{Aggregate, DomainError, EntityId};
use steward_events::{
    CommandEnvelope, CommandMeta, CommandType, EntityState, EntityType, EnvelopeError, Lifecycle,
    LoggedCommand, RoutedCommand, StateChange,
};

/// Document tag stored alongside every client record.
pub const CLIENT_DOCUMENT_TYPE: &str = "ClientState";

// ─────────────────────────────────────────────────────────────────────────────
// Client State
// ─────────────────────────────────────────────────────────────────────────────

/// Primary contact at the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientContact {
    pub name: String,
    pub title: String,
    pub email: String,
    pub phone: String,
}

/// An engagement held with the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Engagement {
    pub engagement_id: String,
    pub name: String,
    pub code: String,
    pub description: String,
    pub is_active: bool,
    pub required_fields_complete: bool,
    pub project_count: u32,
}

/// Aggregate: one client record.
///
/// # Invariants
/// - `id` is set exactly once, by the first logged Insert or Upsert.
/// - Deletion is soft: `is_active` flips, nothing is erased.
/// - Updates are refused while the client is inactive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientState {
    pub id: Option<EntityId>,
    pub document_type: String,
    pub name: String,
    pub is_active: bool,
    pub industry: String,
    pub added_on: Option<DateTime<Utc>>,
    pub client_lead_user_id: String,
    pub contact: ClientContact,
    pub last_active_lead_user_id: String,
    pub last_active_engagement_id: String,
    pub last_active_project_id: String,
    pub last_active_fiscal_year: i32,
    pub last_known_active_project_count: u32,
    pub engagements: Vec<Engagement>,
}

impl ClientState {
    /// Convenience constructor for a payload carrying just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Copy the fields a caller is allowed to change.
    ///
    /// Identity, lifecycle and bookkeeping fields are left untouched.
    fn update_from(&mut self, other: &ClientState) {
        self.name = other.name.clone();
        self.industry = other.industry.clone();
        self.client_lead_user_id = other.client_lead_user_id.clone();
        self.contact = other.contact.clone();
        self.engagements = other.engagements.clone();
    }

    /// Normalize a submitted payload into the record an insert creates.
    fn inserted(id: EntityId, payload: &ClientState) -> ClientState {
        ClientState {
            id: Some(id),
            document_type: CLIENT_DOCUMENT_TYPE.to_string(),
            is_active: true,
            added_on: payload.added_on.or_else(|| Some(Utc::now())),
            ..payload.clone()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Every command a client unit accepts, and the shape it is logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "CommandClass")]
pub enum ClientCommand {
    #[serde(rename = "ClientInsertCommand")]
    Insert(StateChange<ClientState>),
    #[serde(rename = "ClientUpdateCommand")]
    Update(StateChange<ClientState>),
    #[serde(rename = "ClientUpsertCommand")]
    Upsert(StateChange<ClientState>),
    #[serde(rename = "ClientDeleteCommand")]
    Delete(Lifecycle),
    #[serde(rename = "ClientUndeleteCommand")]
    Undelete(Lifecycle),
}

impl ClientCommand {
    pub fn insert(state: ClientState, meta: CommandMeta) -> Self {
        ClientCommand::Insert(StateChange {
            id: None,
            state,
            meta,
        })
    }

    pub fn update(id: EntityId, state: ClientState, meta: CommandMeta) -> Self {
        ClientCommand::Update(StateChange {
            id: Some(id),
            state,
            meta,
        })
    }

    pub fn upsert(id: EntityId, state: ClientState, meta: CommandMeta) -> Self {
        ClientCommand::Upsert(StateChange {
            id: Some(id),
            state,
            meta,
        })
    }

    pub fn delete(id: EntityId, meta: CommandMeta) -> Self {
        ClientCommand::Delete(Lifecycle { id, meta })
    }

    pub fn undelete(id: EntityId, meta: CommandMeta) -> Self {
        ClientCommand::Undelete(Lifecycle { id, meta })
    }
}

impl LoggedCommand for ClientCommand {
    const CLASSES: &'static [&'static str] = &[
        "ClientInsertCommand",
        "ClientUpdateCommand",
        "ClientUpsertCommand",
        "ClientDeleteCommand",
        "ClientUndeleteCommand",
    ];

    fn class(&self) -> &'static str {
        match self {
            ClientCommand::Insert(_) => "ClientInsertCommand",
            ClientCommand::Update(_) => "ClientUpdateCommand",
            ClientCommand::Upsert(_) => "ClientUpsertCommand",
            ClientCommand::Delete(_) => "ClientDeleteCommand",
            ClientCommand::Undelete(_) => "ClientUndeleteCommand",
        }
    }

    /// Lifecycle transitions are snapshotted right away so that a later
    /// incarnation starts in the right state even before the next trigger.
    fn forces_snapshot(&self) -> bool {
        matches!(
            self,
            ClientCommand::Insert(_) | ClientCommand::Delete(_) | ClientCommand::Undelete(_)
        )
    }
}

impl RoutedCommand for ClientCommand {
    fn command_type(&self) -> CommandType {
        match self {
            ClientCommand::Insert(_) => CommandType::Insert,
            ClientCommand::Update(_) => CommandType::Update,
            ClientCommand::Upsert(_) => CommandType::Upsert,
            ClientCommand::Delete(_) => CommandType::Delete,
            ClientCommand::Undelete(_) => CommandType::Undelete,
        }
    }

    fn target(&self) -> Option<EntityId> {
        match self {
            ClientCommand::Insert(c) | ClientCommand::Update(c) | ClientCommand::Upsert(c) => c.id,
            ClientCommand::Delete(c) | ClientCommand::Undelete(c) => Some(c.id),
        }
    }

    fn with_target(self, id: EntityId) -> Self {
        match self {
            ClientCommand::Insert(c) => ClientCommand::Insert(StateChange { id: Some(id), ..c }),
            ClientCommand::Update(c) => ClientCommand::Update(StateChange { id: Some(id), ..c }),
            ClientCommand::Upsert(c) => ClientCommand::Upsert(StateChange { id: Some(id), ..c }),
            ClientCommand::Delete(c) => ClientCommand::Delete(Lifecycle { id, ..c }),
            ClientCommand::Undelete(c) => ClientCommand::Undelete(Lifecycle { id, ..c }),
        }
    }

    fn meta(&self) -> &CommandMeta {
        match self {
            ClientCommand::Insert(c) | ClientCommand::Update(c) | ClientCommand::Upsert(c) => &c.meta,
            ClientCommand::Delete(c) | ClientCommand::Undelete(c) => &c.meta,
        }
    }

    fn payload(&self) -> JsonValue {
        match self {
            ClientCommand::Insert(c) | ClientCommand::Update(c) | ClientCommand::Upsert(c) => {
                serde_json::to_value(&c.state).unwrap_or(JsonValue::Null)
            }
            ClientCommand::Delete(_) | ClientCommand::Undelete(_) => JsonValue::Null,
        }
    }
}

impl TryFrom<CommandEnvelope<JsonValue>> for ClientCommand {
    type Error = EnvelopeError;

    fn try_from(envelope: CommandEnvelope<JsonValue>) -> Result<Self, Self::Error> {
        envelope.expect_entity_type(EntityType::Client)?;
        Ok(match envelope.command_type {
            CommandType::Insert => ClientCommand::Insert(StateChange::from_envelope(envelope)?),
            CommandType::Update => {
                envelope.require_id()?;
                ClientCommand::Update(StateChange::from_envelope(envelope)?)
            }
            CommandType::Upsert => ClientCommand::Upsert(StateChange::from_envelope(envelope)?),
            CommandType::Delete => ClientCommand::Delete(Lifecycle::from_envelope(envelope)?),
            CommandType::Undelete => ClientCommand::Undelete(Lifecycle::from_envelope(envelope)?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision + evolution
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for ClientState {
    type Command = ClientCommand;
    type Error = DomainError;

    fn apply(&mut self, command: &Self::Command) {
        match command {
            ClientCommand::Insert(c) => {
                *self = c.state.clone();
            }
            ClientCommand::Update(c) => self.update_from(&c.state),
            ClientCommand::Upsert(c) => {
                if self.id.is_none() {
                    *self = c.state.clone();
                } else {
                    self.update_from(&c.state);
                }
            }
            ClientCommand::Delete(_) => self.is_active = false,
            ClientCommand::Undelete(_) => self.is_active = true,
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Self::Command, Self::Error> {
        match command {
            ClientCommand::Insert(c) => self.handle_insert(c).map(ClientCommand::Insert),
            ClientCommand::Update(c) => self.handle_update(c).map(ClientCommand::Update),
            ClientCommand::Upsert(c) => self.handle_upsert(c).map(ClientCommand::Upsert),
            ClientCommand::Delete(c) => {
                self.ensure_exists(c.id)?;
                if !self.is_active {
                    return Err(DomainError::conflict("client has already been deleted"));
                }
                Ok(command.clone())
            }
            ClientCommand::Undelete(c) => {
                self.ensure_exists(c.id)?;
                if self.is_active {
                    return Err(DomainError::conflict("client is already active"));
                }
                Ok(command.clone())
            }
        }
    }
}

impl ClientState {
    fn ensure_exists(&self, target: EntityId) -> Result<(), DomainError> {
        match self.id {
            None => Err(DomainError::not_found(format!("client {target} does not exist"))),
            Some(id) if id != target => Err(DomainError::invariant("client id mismatch")),
            Some(_) => Ok(()),
        }
    }

    fn ensure_name(state: &ClientState) -> Result<(), DomainError> {
        if state.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be blank"));
        }
        Ok(())
    }

    fn handle_insert(
        &self,
        c: &StateChange<ClientState>,
    ) -> Result<StateChange<ClientState>, DomainError> {
        if let Some(existing) = self.id {
            return Err(DomainError::conflict(format!("client {existing} already exists")));
        }
        Self::ensure_name(&c.state)?;
        let id = c
            .id
            .ok_or_else(|| DomainError::validation("client id cannot be empty"))?;

        Ok(StateChange {
            id: Some(id),
            state: ClientState::inserted(id, &c.state),
            meta: c.meta.clone(),
        })
    }

    fn handle_update(
        &self,
        c: &StateChange<ClientState>,
    ) -> Result<StateChange<ClientState>, DomainError> {
        let id = c
            .id
            .ok_or_else(|| DomainError::validation("client id cannot be empty"))?;
        self.ensure_exists(id)?;
        if !self.is_active {
            return Err(DomainError::conflict("client is deleted (inactive)"));
        }
        Self::ensure_name(&c.state)?;
        Ok(c.clone())
    }

    fn handle_upsert(
        &self,
        c: &StateChange<ClientState>,
    ) -> Result<StateChange<ClientState>, DomainError> {
        Self::ensure_name(&c.state)?;
        let id = c
            .id
            .ok_or_else(|| DomainError::validation("client id cannot be empty"))?;

        match self.id {
            None => Ok(StateChange {
                id: Some(id),
                state: ClientState::inserted(id, &c.state),
                meta: c.meta.clone(),
            }),
            Some(_) => {
                self.ensure_exists(id)?;
                if !self.is_active && c.state.is_active {
                    return Err(DomainError::conflict(
                        "an inactive client cannot be reactivated through upsert",
                    ));
                }
                Ok(c.clone())
            }
        }
    }
}

impl EntityState for ClientState {
    const ENTITY_TYPE: EntityType = EntityType::Client;

    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.is_active
    }
}
