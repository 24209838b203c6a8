//! Persistence core shared by entity and list units.
//!
//! Owns the unit's state, its position in the log and its snapshot policy.
//! Recovery is driven one [`ReplayItem`] at a time so the run loop can keep
//! stashing inbound messages between steps.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use steward_core::{Aggregate, ExpectedVersion};
use steward_events::LoggedCommand;

use crate::config::{UnitConfig, UnitSetting};
use crate::journal::{
    decode_entry, Journal, JournalError, JournalRecord, PersistenceId, Replayed, SnapshotRecord,
};

use super::{SkippedEntry, UnitPhase, UnitStatus};

/// One step of recovery, in the order the journal hands them out.
#[derive(Debug)]
pub(crate) enum ReplayItem {
    Snapshot(SnapshotRecord),
    Entry(JournalRecord),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryStep {
    Continue,
    Completed,
}

/// Strict recovery met an entry it could not apply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("recovery of '{persistence_id}' aborted at entry {sequence_nr}: {reason}")]
pub(crate) struct RecoveryAborted {
    pub persistence_id: PersistenceId,
    pub sequence_nr: u64,
    pub reason: String,
}

pub(crate) struct Persistent<A> {
    pub persistence_id: PersistenceId,
    journal: Arc<dyn Journal>,
    pub state: A,
    pub config: UnitConfig,
    pub phase: UnitPhase,
    sequence_nr: u64,
    snapshot_nr: u64,
    /// Commands logged since this incarnation started.
    activity: u64,
    skipped: Vec<SkippedEntry>,
}

impl<A> Persistent<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
    A::Command: LoggedCommand,
{
    pub fn new(persistence_id: PersistenceId, journal: Arc<dyn Journal>, config: UnitConfig) -> Self {
        Self {
            persistence_id,
            journal,
            state: A::default(),
            config,
            phase: UnitPhase::Recovering,
            sequence_nr: 0,
            snapshot_nr: 0,
            activity: 0,
            skipped: Vec::new(),
        }
    }

    pub fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    /// Whether entries were logged after the last saved snapshot.
    pub fn is_dirty(&self) -> bool {
        self.sequence_nr > self.snapshot_nr
    }

    /// Read the journal and queue up everything recovery has to go through.
    ///
    /// A failed read is reported and the unit starts empty; the queue always
    /// ends with [`ReplayItem::Completed`].
    pub fn load(&self) -> VecDeque<ReplayItem> {
        let mut items = VecDeque::new();
        match self.journal.read_all(&self.persistence_id) {
            Ok(recovery) => {
                if let Some(snapshot) = recovery.snapshot {
                    items.push_back(ReplayItem::Snapshot(snapshot));
                }
                items.extend(recovery.entries.into_iter().map(ReplayItem::Entry));
            }
            Err(err) => {
                error!(
                    persistence_id = %self.persistence_id,
                    error = %err,
                    "failed to read journal, starting empty"
                );
            }
        }
        items.push_back(ReplayItem::Completed);
        items
    }

    pub fn recover(&mut self, item: ReplayItem) -> Result<RecoveryStep, RecoveryAborted> {
        match item {
            ReplayItem::Snapshot(snapshot) => self.install_snapshot(snapshot),
            ReplayItem::Entry(record) => self.replay(record)?,
            ReplayItem::Completed => {
                self.phase = UnitPhase::CommandProcessing;
                info!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = self.sequence_nr,
                    skipped = self.skipped.len(),
                    "recovered"
                );
                return Ok(RecoveryStep::Completed);
            }
        }
        Ok(RecoveryStep::Continue)
    }

    fn install_snapshot(&mut self, snapshot: SnapshotRecord) {
        match A::deserialize(&snapshot.state) {
            Ok(state) => {
                debug!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = snapshot.sequence_nr,
                    "snapshot installed"
                );
                self.state = state;
                self.sequence_nr = snapshot.sequence_nr;
                self.snapshot_nr = snapshot.sequence_nr;
            }
            Err(err) => {
                warn!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = snapshot.sequence_nr,
                    error = %err,
                    "snapshot unreadable, replaying the full log"
                );
            }
        }
    }

    fn replay(&mut self, record: JournalRecord) -> Result<(), RecoveryAborted> {
        // Entries covered by the snapshot are skipped, except settings: those
        // live outside the state and are not part of the snapshot.
        let covered = record.sequence_nr <= self.sequence_nr;
        if covered && !UnitSetting::CLASSES.contains(&record.class.as_str()) {
            return Ok(());
        }

        match decode_entry::<A::Command>(&record.payload) {
            Ok(Replayed::Command(command)) => self.state.apply(&command),
            Ok(Replayed::Setting(setting)) => self.config.apply(setting),
            Err(err) => {
                error!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = record.sequence_nr,
                    class = err.class().unwrap_or("<none>"),
                    error = %err,
                    "cannot replay log entry"
                );
                if self.config.strict_recovery {
                    return Err(RecoveryAborted {
                        persistence_id: self.persistence_id.clone(),
                        sequence_nr: record.sequence_nr,
                        reason: err.to_string(),
                    });
                }
                self.skipped.push(SkippedEntry {
                    sequence_nr: record.sequence_nr,
                    class: err.class().map(str::to_string),
                    reason: err.to_string(),
                });
            }
        }

        if !covered {
            self.sequence_nr = record.sequence_nr;
        }
        Ok(())
    }

    /// Log `entry`, then apply it. State is untouched if the append fails.
    pub fn persist(&mut self, entry: &A::Command) -> Result<u64, JournalError> {
        let payload =
            serde_json::to_value(entry).map_err(|e| JournalError::Serialization(e.to_string()))?;
        let sequence_nr = self.journal.append(
            &self.persistence_id,
            ExpectedVersion::Exact(self.sequence_nr),
            payload,
        )?;

        self.sequence_nr = sequence_nr;
        self.state.apply(entry);
        self.activity += 1;

        let trigger = u64::from(self.config.snapshot_trigger_count.max(1));
        if entry.forces_snapshot() || self.activity % trigger == 0 {
            self.save_snapshot();
        }
        Ok(sequence_nr)
    }

    /// Log a runtime setting and apply it to the unit's policy.
    pub fn persist_setting(&mut self, setting: UnitSetting) -> Result<(), JournalError> {
        let payload =
            serde_json::to_value(setting).map_err(|e| JournalError::Serialization(e.to_string()))?;
        self.sequence_nr = self.journal.append(
            &self.persistence_id,
            ExpectedVersion::Exact(self.sequence_nr),
            payload,
        )?;
        self.config.apply(setting);
        info!(
            persistence_id = %self.persistence_id,
            setting = setting.class(),
            "setting applied"
        );
        Ok(())
    }

    /// Save a snapshot at the current position. The outcome is only logged.
    pub fn save_snapshot(&mut self) {
        if self.sequence_nr == 0 {
            debug!(persistence_id = %self.persistence_id, "nothing to snapshot");
            return;
        }

        let state = match serde_json::to_value(&self.state) {
            Ok(state) => state,
            Err(err) => {
                error!(persistence_id = %self.persistence_id, error = %err, "failed to serialize snapshot");
                return;
            }
        };

        match self
            .journal
            .save_snapshot(&self.persistence_id, self.sequence_nr, state)
        {
            Ok(()) => {
                self.snapshot_nr = self.sequence_nr;
                info!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = self.sequence_nr,
                    "snapshot saved"
                );
            }
            Err(err) => {
                error!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = self.sequence_nr,
                    error = %err,
                    "failed to save snapshot"
                );
            }
        }
    }

    pub fn status(&self, subscribers: usize, stashed: usize) -> UnitStatus {
        UnitStatus {
            persistence_id: self.persistence_id.to_string(),
            phase: self.phase,
            sequence_nr: self.sequence_nr,
            last_snapshot_nr: self.snapshot_nr,
            snapshot_trigger_count: self.config.snapshot_trigger_count,
            subscribers,
            stashed,
            skipped: self.skipped.clone(),
        }
    }
}
