//! Users domain module (event-sourced user records and their permissions).

pub mod permission;
pub mod user;

pub use permission::{Permission, Role};
pub use user::{UserCommand, UserState};
