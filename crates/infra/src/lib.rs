//! Infrastructure layer: the units and their plumbing.
//!
//! Every stateful piece of the system is a *unit*: a tokio task that owns its
//! state and talks to the rest of the process only through its inbox.
//!
//! - [`entity`]: one unit per business record, backed by its own journal log.
//! - [`list`]: the persisted id index per entity type.
//! - [`accumulator`]: an in-memory view of every entity's full state.
//! - [`supervisor`]: owns the entity units of one type and routes to them.
//! - [`registry`]: the process-wide directory of supervisors.
//! - [`system`]: boots all of the above.

pub mod accumulator;
pub mod config;
pub mod entity;
pub mod journal;
pub mod list;
pub mod registry;
pub mod supervisor;
pub mod system;
pub mod unit;

pub use accumulator::{spawn_accumulator, AccumulatorHandle};
pub use config::{SupervisorConfig, SystemConfig, UnitConfig, UnitSetting};
pub use entity::{spawn_entity, EntityHandle};
pub use journal::{InMemoryJournal, Journal, JournalError, PersistenceId};
pub use list::{spawn_list, ListHandle, ListItem};
pub use registry::{spawn_registry, RegistryHandle, SupervisorRef};
pub use supervisor::{spawn_supervisor, SupervisorHandle, SupervisorPhase, SupervisorStatus};
pub use system::System;
pub use unit::{UnitError, UnitStatus};
