//! Session store implementations
//!
//! Production deployments implement [`SessionStore`] over their analytics
//! database. This module ships the in-memory store used by tests and demos.
//!
//! [`SessionStore`]: crate::query::SessionStore

/// Record-scanning store kept entirely in memory
pub mod memory;

pub use memory::{InMemorySessionStore, SessionRecord};
