//! Clients domain module (event-sourced client records).
//!
//! This crate contains the business rules for clients, implemented purely as
//! deterministic domain logic (no channels, no storage). Units in
//! `steward-infra` drive it.

pub mod client;

pub use client::{ClientCommand, ClientContact, ClientState, Engagement};
