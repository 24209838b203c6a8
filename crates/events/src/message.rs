//! The event every unit emits in answer to a command.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use steward_core::EntityId;

use crate::envelope::CommandMeta;
use crate::event::Event;
use crate::kind::{CommandType, EntityType};

/// Outcome of a command, successful or not.
///
/// A successful message is produced only after the command was logged and
/// carries the post-state in `payload`. Failed messages (`success == false`)
/// describe a rejection in `message` and echo whatever payload was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEventMessage {
    pub id: Option<EntityId>,
    pub display_name: String,
    pub success: bool,
    /// Name of the unit kind that emitted this message (e.g. "client-entity").
    pub emitting_unit: String,
    pub entity_type: EntityType,
    pub command_type: CommandType,
    pub message: String,
    pub payload: JsonValue,
    pub acting_user: String,
    pub connection_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl CommandEventMessage {
    fn base(entity_type: EntityType, command_type: CommandType, meta: &CommandMeta) -> Self {
        Self {
            id: None,
            display_name: String::new(),
            success: true,
            emitting_unit: String::new(),
            entity_type,
            command_type,
            message: String::new(),
            payload: JsonValue::Null,
            acting_user: meta.acting_user.clone(),
            connection_id: meta.connection_id.clone(),
            occurred_at: Utc::now(),
        }
    }

    pub fn succeeded(entity_type: EntityType, command_type: CommandType, meta: &CommandMeta) -> Self {
        Self::base(entity_type, command_type, meta)
    }

    pub fn failed(
        entity_type: EntityType,
        command_type: CommandType,
        meta: &CommandMeta,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            message: reason.into(),
            ..Self::base(entity_type, command_type, meta)
        }
    }

    pub fn emitted_by(mut self, unit: impl Into<String>) -> Self {
        self.emitting_unit = unit.into();
        self
    }

    pub fn for_entity(mut self, id: Option<EntityId>, display_name: impl Into<String>) -> Self {
        self.id = id;
        self.display_name = display_name.into();
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_failure(&self) -> bool {
        !self.success
    }

    /// Decode the payload into a typed entity state.
    pub fn payload_as<S: DeserializeOwned>(&self) -> Result<S, serde_json::Error> {
        S::deserialize(&self.payload)
    }
}

impl Event for CommandEventMessage {
    fn event_type(&self) -> String {
        let stem = self.entity_type.stem();
        if self.success {
            format!("{stem}s.{stem}.{}", self.command_type.outcome())
        } else {
            format!("{stem}s.{stem}.{}_failed", self.command_type.verb())
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CommandMeta {
        CommandMeta::new("ann", "conn-1")
    }

    #[test]
    fn succeeded_copies_caller_identity() {
        let id = EntityId::new();
        let msg = CommandEventMessage::succeeded(EntityType::Client, CommandType::Insert, &meta())
            .emitted_by("client-entity")
            .for_entity(Some(id), "Acme")
            .with_payload(serde_json::json!({ "name": "Acme" }));

        assert!(msg.success);
        assert_eq!(msg.id, Some(id));
        assert_eq!(msg.acting_user, "ann");
        assert_eq!(msg.connection_id, "conn-1");
        assert_eq!(msg.event_type(), "clients.client.inserted");
    }

    #[test]
    fn failed_carries_reason_and_typed_name() {
        let msg = CommandEventMessage::failed(
            EntityType::User,
            CommandType::Update,
            &meta(),
            "user is deleted (inactive)",
        );

        assert!(msg.is_failure());
        assert_eq!(msg.message, "user is deleted (inactive)");
        assert_eq!(msg.event_type(), "users.user.update_failed");
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let msg = CommandEventMessage::succeeded(EntityType::Client, CommandType::Delete, &meta());
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("displayName").is_some());
        assert!(value.get("connectionId").is_some());
        assert_eq!(value["commandType"], "Delete");
    }
}
