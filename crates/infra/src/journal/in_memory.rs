use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value as JsonValue;

use steward_core::ExpectedVersion;

use super::r#trait::{
    class_of, Journal, JournalError, JournalRecord, PersistenceId, Recovery, SnapshotRecord,
};

#[derive(Debug, Default)]
struct Log {
    entries: Vec<JournalRecord>,
    snapshot: Option<SnapshotRecord>,
}

impl Log {
    fn current_version(&self) -> u64 {
        self.entries.last().map(|e| e.sequence_nr).unwrap_or(0)
    }
}

/// In-memory journal.
///
/// Intended for tests/dev and for single-process deployments that accept
/// losing state on restart. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    logs: RwLock<HashMap<PersistenceId, Log>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently logged under `persistence_id`.
    pub fn len(&self, persistence_id: &PersistenceId) -> usize {
        self.logs
            .read()
            .map(|logs| logs.get(persistence_id).map(|l| l.entries.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Every persistence id with at least one entry or snapshot.
    pub fn persistence_ids(&self) -> Vec<PersistenceId> {
        let mut ids: Vec<_> = self
            .logs
            .read()
            .map(|logs| logs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Journal for InMemoryJournal {
    fn append(
        &self,
        persistence_id: &PersistenceId,
        expected: ExpectedVersion,
        entry: JsonValue,
    ) -> Result<u64, JournalError> {
        let class = class_of(&entry)
            .ok_or_else(|| {
                JournalError::InvalidEntry(format!(
                    "entry for '{persistence_id}' has no CommandClass discriminator"
                ))
            })?
            .to_string();

        let mut logs = self
            .logs
            .write()
            .map_err(|_| JournalError::Unavailable("lock poisoned".to_string()))?;

        let log = logs.entry(persistence_id.clone()).or_default();
        let current = log.current_version();

        if !expected.matches(current) {
            return Err(JournalError::Concurrency(format!(
                "'{persistence_id}' expected {expected:?}, found {current}"
            )));
        }

        let sequence_nr = current + 1;
        log.entries.push(JournalRecord {
            persistence_id: persistence_id.clone(),
            sequence_nr,
            class,
            payload: entry,
            recorded_at: Utc::now(),
        });

        Ok(sequence_nr)
    }

    fn read_all(&self, persistence_id: &PersistenceId) -> Result<Recovery, JournalError> {
        let logs = self
            .logs
            .read()
            .map_err(|_| JournalError::Unavailable("lock poisoned".to_string()))?;

        Ok(logs
            .get(persistence_id)
            .map(|log| Recovery {
                snapshot: log.snapshot.clone(),
                entries: log.entries.clone(),
            })
            .unwrap_or_default())
    }

    fn save_snapshot(
        &self,
        persistence_id: &PersistenceId,
        sequence_nr: u64,
        state: JsonValue,
    ) -> Result<(), JournalError> {
        let mut logs = self
            .logs
            .write()
            .map_err(|_| JournalError::Unavailable("lock poisoned".to_string()))?;

        let log = logs.entry(persistence_id.clone()).or_default();
        if sequence_nr > log.current_version() {
            return Err(JournalError::InvalidEntry(format!(
                "snapshot for '{persistence_id}' at {sequence_nr} is ahead of the log ({})",
                log.current_version()
            )));
        }
        // Never replace a newer snapshot with an older one.
        if log
            .snapshot
            .as_ref()
            .is_some_and(|s| s.sequence_nr > sequence_nr)
        {
            return Ok(());
        }

        log.snapshot = Some(SnapshotRecord {
            persistence_id: persistence_id.clone(),
            sequence_nr,
            state,
            saved_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid() -> PersistenceId {
        PersistenceId::new("client-test")
    }

    #[test]
    fn append_assigns_gap_free_sequence_numbers() {
        let journal = InMemoryJournal::new();
        let first = journal
            .append(&pid(), ExpectedVersion::Exact(0), json!({ "CommandClass": "A" }))
            .unwrap();
        let second = journal
            .append(&pid(), ExpectedVersion::Exact(1), json!({ "CommandClass": "B" }))
            .unwrap();

        assert_eq!((first, second), (1, 2));

        let recovery = journal.read_all(&pid()).unwrap();
        let classes: Vec<_> = recovery.entries.iter().map(|e| e.class.as_str()).collect();
        assert_eq!(classes, ["A", "B"]);
        assert_eq!(recovery.last_sequence_nr(), 2);
    }

    #[test]
    fn append_rejects_stale_expected_version() {
        let journal = InMemoryJournal::new();
        journal
            .append(&pid(), ExpectedVersion::Exact(0), json!({ "CommandClass": "A" }))
            .unwrap();

        let err = journal
            .append(&pid(), ExpectedVersion::Exact(0), json!({ "CommandClass": "A" }))
            .unwrap_err();
        match err {
            JournalError::Concurrency(_) => {}
            other => panic!("expected concurrency error, got {other:?}"),
        }
        assert_eq!(journal.len(&pid()), 1);
    }

    #[test]
    fn append_requires_a_discriminator() {
        let journal = InMemoryJournal::new();
        let err = journal
            .append(&pid(), ExpectedVersion::Any, json!({ "name": "Acme" }))
            .unwrap_err();
        assert!(matches!(err, JournalError::InvalidEntry(_)));
    }

    #[test]
    fn unknown_log_reads_empty() {
        let journal = InMemoryJournal::new();
        let recovery = journal.read_all(&pid()).unwrap();
        assert!(recovery.snapshot.is_none());
        assert!(recovery.entries.is_empty());
    }

    #[test]
    fn snapshot_keeps_the_full_log_readable() {
        let journal = InMemoryJournal::new();
        for n in 0..3 {
            journal
                .append(&pid(), ExpectedVersion::Exact(n), json!({ "CommandClass": "A" }))
                .unwrap();
        }
        journal.save_snapshot(&pid(), 2, json!({ "count": 2 })).unwrap();
        journal.save_snapshot(&pid(), 1, json!({ "count": 1 })).unwrap();

        let recovery = journal.read_all(&pid()).unwrap();
        let snapshot = recovery.snapshot.unwrap();
        assert_eq!(snapshot.sequence_nr, 2);
        assert_eq!(snapshot.state, json!({ "count": 2 }));
        assert_eq!(recovery.entries.len(), 3);
    }

    #[test]
    fn snapshot_ahead_of_log_is_rejected() {
        let journal = InMemoryJournal::new();
        let err = journal.save_snapshot(&pid(), 1, json!({})).unwrap_err();
        assert!(matches!(err, JournalError::InvalidEntry(_)));
    }
}
