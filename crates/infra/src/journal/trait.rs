use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use steward_core::{EntityId, ExpectedVersion};
use steward_events::EntityType;

/// Key of one unit's log, e.g. `client-0190f3…` or `client-list`.
///
/// Entity units use `<stem>-<id>`; list units use `<stem>-list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceId(String);

impl PersistenceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn entity(entity_type: EntityType, id: EntityId) -> Self {
        Self(format!("{}-{id}", entity_type.stem()))
    }

    pub fn list(entity_type: EntityType) -> Self {
        Self(format!("{}-list", entity_type.stem()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logged command with its assigned position.
///
/// `payload` is the command exactly as the unit serialized it, including the
/// `CommandClass` discriminator; `class` is copied out of it at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub persistence_id: PersistenceId,
    /// 1-based, gap-free position within the log.
    pub sequence_nr: u64,
    pub class: String,
    pub payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

/// Serialized unit state covering every entry up to and including `sequence_nr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub persistence_id: PersistenceId,
    pub sequence_nr: u64,
    pub state: JsonValue,
    pub saved_at: DateTime<Utc>,
}

/// Everything a unit needs to rebuild itself.
///
/// `entries` always holds the complete log, not just the tail after the
/// snapshot: a unit that cannot read its snapshot falls back to full replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    pub snapshot: Option<SnapshotRecord>,
    pub entries: Vec<JournalRecord>,
}

impl Recovery {
    pub fn last_sequence_nr(&self) -> u64 {
        self.entries.last().map(|e| e.sequence_nr).unwrap_or(0)
    }
}

/// Journal operation error.
///
/// These are infrastructure failures, never domain rejections. A unit that
/// sees one answers the command with a failed event and keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, per-unit command log with snapshot storage.
///
/// ## Append Semantics
///
/// `append()`:
/// - Requires the payload to carry a string `CommandClass` discriminator
/// - Checks optimistic concurrency against the log's last sequence number
/// - Assigns the next sequence number (last + 1) and returns it
///
/// Each unit is the single writer of its own log, so a concurrency failure
/// means two live units claim the same persistence id.
///
/// ## Read Semantics
///
/// `read_all()` returns the latest snapshot (if any) and the full log in
/// sequence order. An unknown persistence id yields an empty [`Recovery`].
pub trait Journal: Send + Sync {
    fn append(
        &self,
        persistence_id: &PersistenceId,
        expected: ExpectedVersion,
        entry: JsonValue,
    ) -> Result<u64, JournalError>;

    fn read_all(&self, persistence_id: &PersistenceId) -> Result<Recovery, JournalError>;

    /// Store a snapshot, replacing any older one for the same log.
    fn save_snapshot(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: u64,
        state: JsonValue,
    ) -> Result<(), JournalError>;
}

impl<J> Journal for Arc<J>
where
    J: Journal + ?Sized,
{
    fn append(
        &self,
        persistence_id: &PersistenceId,
        expected: ExpectedVersion,
        entry: JsonValue,
    ) -> Result<u64, JournalError> {
        (**self).append(persistence_id, expected, entry)
    }

    fn read_all(&self, persistence_id: &PersistenceId) -> Result<Recovery, JournalError> {
        (**self).read_all(persistence_id)
    }

    fn save_snapshot(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: u64,
        state: JsonValue,
    ) -> Result<(), JournalError> {
        (**self).save_snapshot(persistence_id, sequence_nr, state)
    }
}

/// Discriminator of a logged entry, if it has one.
pub fn class_of(entry: &JsonValue) -> Option<&str> {
    entry.get(super::CLASS_FIELD).and_then(JsonValue::as_str)
}
