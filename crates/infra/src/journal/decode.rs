//! Decoding logged entries back into typed commands during recovery.

use serde_json::Value as JsonValue;
use thiserror::Error;

use steward_events::LoggedCommand;

use crate::config::UnitSetting;

use super::r#trait::class_of;

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Replayed<C> {
    /// A domain command to fold onto the unit's state.
    Command(C),
    /// A runtime setting the unit applied to itself.
    Setting(UnitSetting),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("entry has no CommandClass discriminator")]
    MissingDiscriminator,

    #[error("unknown discriminator '{0}'")]
    UnknownDiscriminator(String),

    #[error("malformed '{class}' entry: {reason}")]
    Malformed { class: String, reason: String },
}

impl DecodeError {
    pub fn class(&self) -> Option<&str> {
        match self {
            DecodeError::MissingDiscriminator => None,
            DecodeError::UnknownDiscriminator(class) => Some(class),
            DecodeError::Malformed { class, .. } => Some(class),
        }
    }
}

/// Decode one entry for a unit whose commands are `C`.
///
/// Unit settings are recognized for every unit kind.
pub fn decode_entry<C: LoggedCommand>(entry: &JsonValue) -> Result<Replayed<C>, DecodeError> {
    let class = class_of(entry).ok_or(DecodeError::MissingDiscriminator)?;

    let malformed = |e: serde_json::Error| DecodeError::Malformed {
        class: class.to_string(),
        reason: e.to_string(),
    };

    if UnitSetting::CLASSES.contains(&class) {
        return UnitSetting::deserialize_entry(entry)
            .map(Replayed::Setting)
            .map_err(malformed);
    }
    if C::CLASSES.contains(&class) {
        return C::deserialize(entry).map(Replayed::Command).map_err(malformed);
    }

    Err(DecodeError::UnknownDiscriminator(class.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steward_clients::{ClientCommand, ClientState};
    use steward_events::CommandMeta;

    #[test]
    fn decodes_domain_commands_by_discriminator() {
        let command = ClientCommand::insert(ClientState::named("Acme"), CommandMeta::new("ann", "c1"));
        let entry = serde_json::to_value(&command).unwrap();
        assert_eq!(entry["CommandClass"], "ClientInsertCommand");

        match decode_entry::<ClientCommand>(&entry).unwrap() {
            Replayed::Command(decoded) => assert_eq!(decoded, command),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn decodes_settings_for_any_unit() {
        let entry = json!({ "CommandClass": "SetSnapshotTriggerCount", "value": 7 });
        assert_eq!(
            decode_entry::<ClientCommand>(&entry).unwrap(),
            Replayed::Setting(UnitSetting::SetSnapshotTriggerCount { value: 7 })
        );
    }

    #[test]
    fn unknown_discriminator_is_reported_by_name() {
        let entry = json!({ "CommandClass": "ClientArchiveCommand" });
        let err = decode_entry::<ClientCommand>(&entry).unwrap_err();
        assert_eq!(err, DecodeError::UnknownDiscriminator("ClientArchiveCommand".to_string()));
        assert_eq!(err.class(), Some("ClientArchiveCommand"));
    }

    #[test]
    fn known_discriminator_with_bad_fields_is_malformed() {
        let entry = json!({ "CommandClass": "ClientDeleteCommand", "id": 12 });
        match decode_entry::<ClientCommand>(&entry).unwrap_err() {
            DecodeError::Malformed { class, .. } => assert_eq!(class, "ClientDeleteCommand"),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn missing_discriminator() {
        let err = decode_entry::<ClientCommand>(&json!({ "id": 1 })).unwrap_err();
        assert_eq!(err, DecodeError::MissingDiscriminator);
    }
}
