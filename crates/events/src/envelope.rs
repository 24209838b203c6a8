use serde::{Deserialize, Serialize};
use thiserror::Error;

use steward_core::EntityId;

use crate::kind::{CommandType, EntityType};

/// Who issued a command and where the answer should eventually go.
///
/// Carried verbatim from the inbound command to every event it produces.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandMeta {
    pub acting_user: String,
    pub connection_id: String,
    /// Optional hint naming the field the caller edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_hint: Option<String>,
}

impl CommandMeta {
    pub fn new(acting_user: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            acting_user: acting_user.into(),
            connection_id: connection_id.into(),
            field_hint: None,
        }
    }

    pub fn with_field_hint(mut self, hint: impl Into<String>) -> Self {
        self.field_hint = Some(hint.into());
        self
    }
}

/// A command as delivered by the inbound bridge.
///
/// Notes:
/// - `id` is optional: an Insert without an id asks the supervisor to allocate one.
/// - `payload` is the entity's full state for Insert/Update/Upsert and is not
///   needed for Delete/Undelete.
/// - Domain crates convert this into their closed command enum via `TryFrom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope<P> {
    pub id: Option<EntityId>,
    pub entity_type: EntityType,
    pub command_type: CommandType,
    pub payload: Option<P>,
    pub meta: CommandMeta,
}

impl<P> CommandEnvelope<P> {
    pub fn new(entity_type: EntityType, command_type: CommandType, meta: CommandMeta) -> Self {
        Self {
            id: None,
            entity_type,
            command_type,
            payload: None,
            meta,
        }
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Fail unless the envelope is addressed to `expected`.
    pub fn expect_entity_type(&self, expected: EntityType) -> Result<(), EnvelopeError> {
        if self.entity_type != expected {
            return Err(EnvelopeError::WrongEntityType {
                expected,
                actual: self.entity_type,
            });
        }
        Ok(())
    }

    /// Take the payload, failing if the command type needs one and it is absent.
    pub fn take_payload(&mut self) -> Result<P, EnvelopeError> {
        self.payload
            .take()
            .ok_or(EnvelopeError::MissingPayload(self.command_type))
    }

    pub fn require_id(&self) -> Result<EntityId, EnvelopeError> {
        self.id.ok_or(EnvelopeError::MissingId(self.command_type))
    }
}

/// Mapping an inbound envelope onto a concrete command failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope addressed to {actual}, expected {expected}")]
    WrongEntityType {
        expected: EntityType,
        actual: EntityType,
    },

    #[error("{0:?} requires a payload")]
    MissingPayload(CommandType),

    #[error("{0:?} requires an id")]
    MissingId(CommandType),

    #[error("payload does not decode: {0}")]
    Payload(String),
}
