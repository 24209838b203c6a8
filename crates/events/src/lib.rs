//! Message vocabulary shared by every unit: commands, command events,
//! addresses and subscriber fan-out.

pub mod address;
pub mod command;
pub mod envelope;
pub mod event;
pub mod kind;
pub mod message;
pub mod subscribers;

pub use address::{Address, Recipient, Reply};
pub use command::{EntityState, Lifecycle, LoggedCommand, RoutedCommand, StateChange};
pub use envelope::{CommandEnvelope, CommandMeta, EnvelopeError};
pub use event::Event;
pub use kind::{CommandType, EntityType};
pub use message::CommandEventMessage;
pub use subscribers::SubscriberSet;
