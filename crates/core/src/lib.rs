//! `steward-core`: foundation primitives shared by every entity type.
//!
//! This crate contains **pure domain** building blocks (no channels, no storage).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, ExpectedVersion, rehydrate};
pub use error::{DomainError, DomainResult};
pub use id::EntityId;
