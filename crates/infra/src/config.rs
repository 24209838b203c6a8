//! Configuration loading and representation.
//!
//! Plain structs with defaults and builder-style setters. `SystemConfig::from_env`
//! reads `STEWARD_*` variables and falls back to the defaults for anything
//! missing or unparsable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::unit::LinearBackoff;

/// Policy of one persistent unit (entity or list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    /// Snapshot after every N successfully logged commands.
    pub snapshot_trigger_count: u32,
    /// Idle time after which an entity unit snapshots and stops.
    pub inactivity_flush: Duration,
    /// Messages buffered while recovering; `None` is unbounded.
    pub stash_capacity: Option<usize>,
    /// Refuse to start when recovery meets an entry it cannot decode.
    pub strict_recovery: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            snapshot_trigger_count: 5,
            inactivity_flush: Duration::from_secs(30 * 24 * 60 * 60),
            stash_capacity: None,
            strict_recovery: false,
        }
    }
}

impl UnitConfig {
    pub fn with_snapshot_trigger_count(mut self, n: u32) -> Self {
        self.snapshot_trigger_count = n.max(1);
        self
    }

    pub fn with_inactivity_flush(mut self, idle: Duration) -> Self {
        self.inactivity_flush = idle;
        self
    }

    pub fn with_stash_capacity(mut self, capacity: usize) -> Self {
        self.stash_capacity = Some(capacity);
        self
    }

    pub fn with_strict_recovery(mut self, strict: bool) -> Self {
        self.strict_recovery = strict;
        self
    }

    /// Apply a persisted runtime setting.
    pub fn apply(&mut self, setting: UnitSetting) {
        match setting {
            UnitSetting::SetSnapshotTriggerCount { value } => {
                self.snapshot_trigger_count = value.max(1);
            }
            UnitSetting::SetInactivityFlushSec { value } => {
                self.inactivity_flush = Duration::from_secs(value);
            }
        }
    }
}

/// Runtime policy change, logged like any other command so it survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "CommandClass")]
pub enum UnitSetting {
    SetSnapshotTriggerCount { value: u32 },
    SetInactivityFlushSec { value: u64 },
}

impl UnitSetting {
    pub const CLASSES: &'static [&'static str] =
        &["SetSnapshotTriggerCount", "SetInactivityFlushSec"];

    pub fn class(&self) -> &'static str {
        match self {
            UnitSetting::SetSnapshotTriggerCount { .. } => "SetSnapshotTriggerCount",
            UnitSetting::SetInactivityFlushSec { .. } => "SetInactivityFlushSec",
        }
    }

    pub(crate) fn deserialize_entry(entry: &JsonValue) -> Result<Self, serde_json::Error> {
        Self::deserialize(entry)
    }
}

/// Policy of one supervisor and the read models it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub registration_timeout: Duration,
    /// Retries after the first registration attempt. Also bounds how often a
    /// list unit that fails to start is restarted.
    pub registration_retries: u32,
    pub registration_backoff: LinearBackoff,
    pub list_poll_interval: Duration,
    pub accumulator_pull_timeout: Duration,
    /// Applied to every child entity and the list unit.
    pub unit: UnitConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(5),
            registration_retries: 5,
            registration_backoff: LinearBackoff::new(Duration::from_secs(5), Duration::from_secs(60)),
            list_poll_interval: Duration::from_secs(5),
            accumulator_pull_timeout: Duration::from_secs(10),
            unit: UnitConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_registration_retries(mut self, retries: u32) -> Self {
        self.registration_retries = retries;
        self
    }

    pub fn with_registration_backoff(mut self, backoff: LinearBackoff) -> Self {
        self.registration_backoff = backoff;
        self
    }

    pub fn with_list_poll_interval(mut self, interval: Duration) -> Self {
        self.list_poll_interval = interval;
        self
    }

    pub fn with_accumulator_pull_timeout(mut self, timeout: Duration) -> Self {
        self.accumulator_pull_timeout = timeout;
        self
    }

    pub fn with_unit(mut self, unit: UnitConfig) -> Self {
        self.unit = unit;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    pub supervisor: SupervisorConfig,
}

impl SystemConfig {
    /// Read overrides from `STEWARD_*` environment variables.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `STEWARD_SNAPSHOT_TRIGGER_COUNT` | `unit.snapshot_trigger_count` |
    /// | `STEWARD_INACTIVITY_FLUSH_SECS` | `unit.inactivity_flush` |
    /// | `STEWARD_STASH_CAPACITY` | `unit.stash_capacity` |
    /// | `STEWARD_STRICT_RECOVERY` | `unit.strict_recovery` |
    /// | `STEWARD_REGISTRATION_TIMEOUT_SECS` | `registration_timeout` |
    /// | `STEWARD_REGISTRATION_RETRIES` | `registration_retries` |
    /// | `STEWARD_LIST_POLL_INTERVAL_SECS` | `list_poll_interval` |
    /// | `STEWARD_ACCUMULATOR_PULL_TIMEOUT_SECS` | `accumulator_pull_timeout` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        }

        let mut config = Self::default();
        let sup = &mut config.supervisor;

        if let Some(n) = parsed::<u32>(&lookup, "STEWARD_SNAPSHOT_TRIGGER_COUNT") {
            sup.unit.snapshot_trigger_count = n.max(1);
        }
        if let Some(secs) = parsed(&lookup, "STEWARD_INACTIVITY_FLUSH_SECS") {
            sup.unit.inactivity_flush = Duration::from_secs(secs);
        }
        if let Some(capacity) = parsed(&lookup, "STEWARD_STASH_CAPACITY") {
            sup.unit.stash_capacity = Some(capacity);
        }
        if let Some(strict) = parsed(&lookup, "STEWARD_STRICT_RECOVERY") {
            sup.unit.strict_recovery = strict;
        }
        if let Some(secs) = parsed(&lookup, "STEWARD_REGISTRATION_TIMEOUT_SECS") {
            sup.registration_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parsed(&lookup, "STEWARD_REGISTRATION_RETRIES") {
            sup.registration_retries = retries;
        }
        if let Some(secs) = parsed(&lookup, "STEWARD_LIST_POLL_INTERVAL_SECS") {
            sup.list_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "STEWARD_ACCUMULATOR_PULL_TIMEOUT_SECS") {
            sup.accumulator_pull_timeout = Duration::from_secs(secs);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.supervisor.unit.snapshot_trigger_count, 5);
        assert_eq!(config.supervisor.unit.stash_capacity, None);
        assert!(!config.supervisor.unit.strict_recovery);
        assert_eq!(config.supervisor.registration_retries, 5);
        assert_eq!(config.supervisor.registration_backoff.cap, Duration::from_secs(60));
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("STEWARD_SNAPSHOT_TRIGGER_COUNT", "12"),
            ("STEWARD_STRICT_RECOVERY", "true"),
            ("STEWARD_REGISTRATION_RETRIES", "lots"),
        ]
        .into_iter()
        .collect();

        let config = SystemConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.supervisor.unit.snapshot_trigger_count, 12);
        assert!(config.supervisor.unit.strict_recovery);
        assert_eq!(config.supervisor.registration_retries, 5);
    }

    #[test]
    fn settings_serialize_with_discriminator() {
        let setting = UnitSetting::SetInactivityFlushSec { value: 90 };
        let value = serde_json::to_value(setting).unwrap();
        assert_eq!(value, serde_json::json!({ "CommandClass": "SetInactivityFlushSec", "value": 90 }));
        assert!(UnitSetting::CLASSES.contains(&setting.class()));

        let mut unit = UnitConfig::default();
        unit.apply(setting);
        assert_eq!(unit.inactivity_flush, Duration::from_secs(90));

        unit.apply(UnitSetting::SetSnapshotTriggerCount { value: 0 });
        assert_eq!(unit.snapshot_trigger_count, 1);
    }
}
