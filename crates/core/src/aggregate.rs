//! Aggregate trait for command-logged state machines.

use core::borrow::Borrow;

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a log append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the log to end at an exact sequence number.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` validates a command against the
///   current state and returns the entry that must be logged.
/// - **State mutation**: `apply(&mut self, entry)` evolves state from a logged entry.
///
/// The logged entry is a command, not a derived event: recovery feeds the very
/// same entries back through `apply`, so live processing and replay cannot
/// drift apart. Implementations must not perform IO.
pub trait Aggregate: Clone + Default + core::fmt::Debug {
    type Command: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single logged entry.
    ///
    /// Must be total: an entry that was accepted once is always applicable
    /// during replay.
    fn apply(&mut self, command: &Self::Command);

    /// Decide whether `command` may be logged, returning the (possibly
    /// normalized) entry to append.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    fn handle(&self, command: &Self::Command) -> Result<Self::Command, Self::Error>;
}

/// Fold logged entries, in order, onto `state`.
pub fn rehydrate<A, I>(mut state: A, commands: I) -> A
where
    A: Aggregate,
    I: IntoIterator,
    I::Item: Borrow<A::Command>,
{
    for command in commands {
        state.apply(command.borrow());
    }
    state
}
