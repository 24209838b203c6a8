//! Per-unit command journal.
//!
//! Every persistent unit owns one log keyed by its [`PersistenceId`]. Entries
//! are the unit's accepted commands as JSON, tagged with a `CommandClass`
//! discriminator. The journal is storage only: it never interprets entries.

pub mod decode;
pub mod in_memory;
pub mod r#trait;

pub use decode::{decode_entry, DecodeError, Replayed};
pub use in_memory::InMemoryJournal;
pub use r#trait::{
    class_of, Journal, JournalError, JournalRecord, PersistenceId, Recovery, SnapshotRecord,
};

/// Name of the discriminator field carried by every logged entry.
pub const CLASS_FIELD: &str = "CommandClass";
