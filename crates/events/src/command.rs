use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use steward_core::{Aggregate, DomainError, EntityId};

use crate::envelope::{CommandEnvelope, CommandMeta, EnvelopeError};
use crate::kind::{CommandType, EntityType};

/// A command that can be appended to a unit's log.
///
/// Logged commands serialize as `{"CommandClass": "<discriminator>", ...fields}`.
/// Implementations are closed enums using `#[serde(tag = "CommandClass")]`, so
/// the discriminator→variant mapping is checked by the compiler rather than
/// looked up at runtime.
///
/// ## Design Constraints
///
/// Commands must be:
/// - **Cloneable**: the same value is logged, applied and echoed in events
/// - **Send + Sync + 'static**: they cross unit boundaries
/// - **Serializable**: they are the log's payload
pub trait LoggedCommand:
    Clone + core::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Every discriminator this type decodes. Used during recovery to tell an
    /// unknown discriminator apart from a malformed entry.
    const CLASSES: &'static [&'static str];

    /// Discriminator of this value.
    fn class(&self) -> &'static str;

    /// Whether logging this command should trigger an immediate snapshot.
    fn forces_snapshot(&self) -> bool {
        false
    }
}

/// A logged command addressed to one entity and routed by a supervisor.
pub trait RoutedCommand:
    LoggedCommand + TryFrom<CommandEnvelope<JsonValue>, Error = EnvelopeError>
{
    fn command_type(&self) -> CommandType;

    /// The addressed entity, if the caller named one.
    fn target(&self) -> Option<EntityId>;

    /// Address the command to `id` (used when the supervisor allocates an id).
    fn with_target(self, id: EntityId) -> Self;

    fn meta(&self) -> &CommandMeta;

    /// Submitted payload, echoed back in failed events.
    fn payload(&self) -> JsonValue {
        JsonValue::Null
    }
}

/// State of one business entity, driven by an entity unit.
pub trait EntityState:
    Aggregate<Command: RoutedCommand, Error = DomainError>
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const ENTITY_TYPE: EntityType;

    /// The entity's id once inserted; `None` for a fresh unit.
    fn entity_id(&self) -> Option<EntityId>;

    fn display_name(&self) -> &str;

    fn is_active(&self) -> bool;
}

/// Payload of a command that carries a full entity state (Insert, Update, Upsert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange<S> {
    pub id: Option<EntityId>,
    pub state: S,
    pub meta: CommandMeta,
}

impl<S: DeserializeOwned> StateChange<S> {
    /// Build from an inbound envelope, decoding its JSON payload.
    pub fn from_envelope(mut envelope: CommandEnvelope<JsonValue>) -> Result<Self, EnvelopeError> {
        let payload = envelope.take_payload()?;
        let state = S::deserialize(&payload).map_err(|e| EnvelopeError::Payload(e.to_string()))?;
        Ok(Self {
            id: envelope.id,
            state,
            meta: envelope.meta,
        })
    }
}

/// Payload of a command that only flips the lifecycle flag (Delete, Undelete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub id: EntityId,
    pub meta: CommandMeta,
}

impl Lifecycle {
    pub fn from_envelope(envelope: CommandEnvelope<JsonValue>) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: envelope.require_id()?,
            meta: envelope.meta,
        })
    }
}
