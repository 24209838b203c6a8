//! Building blocks shared by every unit: the persistence core, the stash,
//! retry backoff and the run loop.

pub mod backoff;
pub(crate) mod persistent;
pub(crate) mod runtime;
pub mod stash;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::journal::JournalError;

pub use backoff::LinearBackoff;
pub use stash::Stash;

/// Error returned by unit handles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// The unit stopped (or refused the message) before answering.
    #[error("unit is gone")]
    Gone,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out waiting for the unit")]
    Timeout,

    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl From<oneshot::error::RecvError> for UnitError {
    fn from(_: oneshot::error::RecvError) -> Self {
        UnitError::Gone
    }
}

/// Lifecycle phase of a persistent unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitPhase {
    Recovering,
    CommandProcessing,
}

/// A log entry recovery could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub sequence_nr: u64,
    pub class: Option<String>,
    pub reason: String,
}

/// Debug view of a persistent unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub persistence_id: String,
    pub phase: UnitPhase,
    pub sequence_nr: u64,
    pub last_snapshot_nr: u64,
    pub snapshot_trigger_count: u32,
    pub subscribers: usize,
    pub stashed: usize,
    pub skipped: Vec<SkippedEntry>,
}

/// Acknowledgement of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscribed {
    /// Kind of the unit subscribed to, e.g. "client-entity".
    pub unit_type: String,
    pub persistence_id: String,
}

/// Whether a run loop keeps going after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}
