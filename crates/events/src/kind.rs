//! Closed sets of entity types and command types.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use steward_core::DomainError;

/// Kind of business entity a supervisor tree is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Client,
    User,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Client, EntityType::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Client => "Client",
            EntityType::User => "User",
        }
    }

    /// Lowercase stem used in unit names and event types.
    pub fn stem(&self) -> &'static str {
        match self {
            EntityType::Client => "client",
            EntityType::User => "user",
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown entity type '{s}'")))
    }
}

/// What a command asks an entity to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    Insert,
    Update,
    Delete,
    Undelete,
    Upsert,
}

impl CommandType {
    /// Past-tense name of the successful outcome ("inserted", ...).
    pub fn outcome(&self) -> &'static str {
        match self {
            CommandType::Insert => "inserted",
            CommandType::Update => "updated",
            CommandType::Delete => "deleted",
            CommandType::Undelete => "undeleted",
            CommandType::Upsert => "upserted",
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            CommandType::Insert => "insert",
            CommandType::Update => "update",
            CommandType::Delete => "delete",
            CommandType::Undelete => "undelete",
            CommandType::Upsert => "upsert",
        }
    }
}
