//! User aggregate (event-sourced).
//!
//! A user record is created once, edited while active and soft-deleted.
//! `user_name` is the only required field.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use steward_core::{Aggregate, DomainError, EntityId};
use steward_events::{
    CommandEnvelope, CommandMeta, CommandType, EntityState, EntityType, EnvelopeError, Lifecycle,
    LoggedCommand, RoutedCommand, StateChange,
};

use crate::permission::{Permission, Role};

pub const USER_DOCUMENT_TYPE: &str = "UserState";

// ─────────────────────────────────────────────────────────────────────────────
// User State
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate: one user record.
///
/// # Invariants
/// - `id` is set exactly once, by the first logged Insert or Upsert.
/// - `user_name` is never blank once inserted.
/// - Inactive users cannot be edited, only undeleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserState {
    pub id: Option<EntityId>,
    pub document_type: String,
    pub user_name: String,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub title: String,
    pub email: String,
    pub phone: String,
    pub avatar_url: String,
    pub default_permissions: bool,
    pub global_role: Option<Role>,
    pub default_role: Option<Role>,
    pub is_active: bool,
    pub industry: String,
    pub added_on: Option<DateTime<Utc>>,
    pub last_logged_on: Option<DateTime<Utc>>,
    pub last_active_engagement_id: String,
    pub last_active_project_id: String,
    pub last_known_active_project_count: u32,
    pub permissions: BTreeMap<String, Permission>,
}

impl UserState {
    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ..Self::default()
        }
    }

    fn update_from(&mut self, other: &UserState) {
        self.user_name = other.user_name.clone();
        self.first_name = other.first_name.clone();
        self.middle_name = other.middle_name.clone();
        self.last_name = other.last_name.clone();
        self.title = other.title.clone();
        self.email = other.email.clone();
        self.phone = other.phone.clone();
        self.avatar_url = other.avatar_url.clone();
        self.default_permissions = other.default_permissions;
        self.global_role = other.global_role.clone();
        self.default_role = other.default_role.clone();
        self.industry = other.industry.clone();
        self.last_logged_on = other.last_logged_on;
        self.last_active_engagement_id = other.last_active_engagement_id.clone();
        self.last_active_project_id = other.last_active_project_id.clone();
        self.last_known_active_project_count = other.last_known_active_project_count;
        self.permissions = other.permissions.clone();
    }

    fn inserted(id: EntityId, payload: &UserState) -> UserState {
        UserState {
            id: Some(id),
            document_type: USER_DOCUMENT_TYPE.to_string(),
            is_active: true,
            added_on: payload.added_on.or_else(|| Some(Utc::now())),
            ..payload.clone()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// User Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "CommandClass")]
pub enum UserCommand {
    #[serde(rename = "UserInsertCommand")]
    Insert(StateChange<UserState>),
    #[serde(rename = "UserUpdateCommand")]
    Update(StateChange<UserState>),
    #[serde(rename = "UserUpsertCommand")]
    Upsert(StateChange<UserState>),
    #[serde(rename = "UserDeleteCommand")]
    Delete(Lifecycle),
    #[serde(rename = "UserUndeleteCommand")]
    Undelete(Lifecycle),
}

impl UserCommand {
    pub fn insert(state: UserState, meta: CommandMeta) -> Self {
        UserCommand::Insert(StateChange {
            id: None,
            state,
            meta,
        })
    }

    pub fn update(id: EntityId, state: UserState, meta: CommandMeta) -> Self {
        UserCommand::Update(StateChange {
            id: Some(id),
            state,
            meta,
        })
    }

    pub fn upsert(id: EntityId, state: UserState, meta: CommandMeta) -> Self {
        UserCommand::Upsert(StateChange {
            id: Some(id),
            state,
            meta,
        })
    }

    pub fn delete(id: EntityId, meta: CommandMeta) -> Self {
        UserCommand::Delete(Lifecycle { id, meta })
    }

    pub fn undelete(id: EntityId, meta: CommandMeta) -> Self {
        UserCommand::Undelete(Lifecycle { id, meta })
    }
}

impl LoggedCommand for UserCommand {
    const CLASSES: &'static [&'static str] = &[
        "UserInsertCommand",
        "UserUpdateCommand",
        "UserUpsertCommand",
        "UserDeleteCommand",
        "UserUndeleteCommand",
    ];

    fn class(&self) -> &'static str {
        match self {
            UserCommand::Insert(_) => "UserInsertCommand",
            UserCommand::Update(_) => "UserUpdateCommand",
            UserCommand::Upsert(_) => "UserUpsertCommand",
            UserCommand::Delete(_) => "UserDeleteCommand",
            UserCommand::Undelete(_) => "UserUndeleteCommand",
        }
    }

    fn forces_snapshot(&self) -> bool {
        matches!(
            self,
            UserCommand::Insert(_) | UserCommand::Delete(_) | UserCommand::Undelete(_)
        )
    }
}

impl RoutedCommand for UserCommand {
    fn command_type(&self) -> CommandType {
        match self {
            UserCommand::Insert(_) => CommandType::Insert,
            UserCommand::Update(_) => CommandType::Update,
            UserCommand::Upsert(_) => CommandType::Upsert,
            UserCommand::Delete(_) => CommandType::Delete,
            UserCommand::Undelete(_) => CommandType::Undelete,
        }
    }

    fn target(&self) -> Option<EntityId> {
        match self {
            UserCommand::Insert(c) | UserCommand::Update(c) | UserCommand::Upsert(c) => c.id,
            UserCommand::Delete(c) | UserCommand::Undelete(c) => Some(c.id),
        }
    }

    fn with_target(self, id: EntityId) -> Self {
        match self {
            UserCommand::Insert(c) => UserCommand::Insert(StateChange { id: Some(id), ..c }),
            UserCommand::Update(c) => UserCommand::Update(StateChange { id: Some(id), ..c }),
            UserCommand::Upsert(c) => UserCommand::Upsert(StateChange { id: Some(id), ..c }),
            UserCommand::Delete(c) => UserCommand::Delete(Lifecycle { id, ..c }),
            UserCommand::Undelete(c) => UserCommand::Undelete(Lifecycle { id, ..c }),
        }
    }

    fn meta(&self) -> &CommandMeta {
        match self {
            UserCommand::Insert(c) | UserCommand::Update(c) | UserCommand::Upsert(c) => &c.meta,
            UserCommand::Delete(c) | UserCommand::Undelete(c) => &c.meta,
        }
    }

    fn payload(&self) -> JsonValue {
        match self {
            UserCommand::Insert(c) | UserCommand::Update(c) | UserCommand::Upsert(c) => {
                serde_json::to_value(&c.state).unwrap_or(JsonValue::Null)
            }
            UserCommand::Delete(_) | UserCommand::Undelete(_) => JsonValue::Null,
        }
    }
}

impl TryFrom<CommandEnvelope<JsonValue>> for UserCommand {
    type Error = EnvelopeError;

    fn try_from(envelope: CommandEnvelope<JsonValue>) -> Result<Self, Self::Error> {
        envelope.expect_entity_type(EntityType::User)?;
        Ok(match envelope.command_type {
            CommandType::Insert => UserCommand::Insert(StateChange::from_envelope(envelope)?),
            CommandType::Update => {
                envelope.require_id()?;
                UserCommand::Update(StateChange::from_envelope(envelope)?)
            }
            CommandType::Upsert => UserCommand::Upsert(StateChange::from_envelope(envelope)?),
            CommandType::Delete => UserCommand::Delete(Lifecycle::from_envelope(envelope)?),
            CommandType::Undelete => UserCommand::Undelete(Lifecycle::from_envelope(envelope)?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for UserState {
    type Command = UserCommand;
    type Error = DomainError;

    fn apply(&mut self, command: &Self::Command) {
        match command {
            UserCommand::Insert(c) => *self = c.state.clone(),
            UserCommand::Update(c) => self.update_from(&c.state),
            UserCommand::Upsert(c) if self.id.is_none() => *self = c.state.clone(),
            UserCommand::Upsert(c) => self.update_from(&c.state),
            UserCommand::Delete(_) => self.is_active = false,
            UserCommand::Undelete(_) => self.is_active = true,
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Self::Command, Self::Error> {
        match command {
            UserCommand::Insert(c) => {
                if let Some(existing) = self.id {
                    return Err(DomainError::conflict(format!("user {existing} already exists")));
                }
                let id = Self::required_id(c)?;
                Self::ensure_user_name(&c.state)?;
                Ok(UserCommand::Insert(StateChange {
                    id: Some(id),
                    state: UserState::inserted(id, &c.state),
                    meta: c.meta.clone(),
                }))
            }
            UserCommand::Update(c) => {
                self.ensure_exists(Self::required_id(c)?)?;
                if !self.is_active {
                    return Err(DomainError::conflict("user is deleted (inactive)"));
                }
                Self::ensure_user_name(&c.state)?;
                Ok(command.clone())
            }
            UserCommand::Upsert(c) => {
                let id = Self::required_id(c)?;
                Self::ensure_user_name(&c.state)?;
                if self.id.is_none() {
                    return Ok(UserCommand::Upsert(StateChange {
                        id: Some(id),
                        state: UserState::inserted(id, &c.state),
                        meta: c.meta.clone(),
                    }));
                }
                self.ensure_exists(id)?;
                if !self.is_active && c.state.is_active {
                    return Err(DomainError::conflict(
                        "an inactive user cannot be reactivated through upsert",
                    ));
                }
                Ok(command.clone())
            }
            UserCommand::Delete(c) => {
                self.ensure_exists(c.id)?;
                if !self.is_active {
                    return Err(DomainError::conflict("user has already been deleted"));
                }
                Ok(command.clone())
            }
            UserCommand::Undelete(c) => {
                self.ensure_exists(c.id)?;
                if self.is_active {
                    return Err(DomainError::conflict("user is already active"));
                }
                Ok(command.clone())
            }
        }
    }
}

impl UserState {
    fn required_id(c: &StateChange<UserState>) -> Result<EntityId, DomainError> {
        c.id.ok_or_else(|| DomainError::validation("user id cannot be empty"))
    }

    fn ensure_user_name(state: &UserState) -> Result<(), DomainError> {
        if state.user_name.trim().is_empty() {
            return Err(DomainError::validation("user name cannot be blank"));
        }
        Ok(())
    }

    fn ensure_exists(&self, target: EntityId) -> Result<(), DomainError> {
        match self.id {
            None => Err(DomainError::not_found(format!("user {target} does not exist"))),
            Some(id) if id != target => Err(DomainError::invariant("user id mismatch")),
            Some(_) => Ok(()),
        }
    }
}

impl EntityState for UserState {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.user_name
    }

    fn is_active(&self) -> bool {
        self.is_active
    }
}
