//! Identity and share registry.
//!
//! This module provides the single source of truth for identities and their
//! shares: an in-memory snapshot guarded by one read-write lock, a secondary
//! index for name/address lookups, and a periodic task that persists the
//! snapshot to JSON whenever it changed.

pub mod index;
pub mod persist;
pub mod store;

pub use index::{IdentityIndex, Slot};
pub use persist::spawn_persistence_task;
pub use store::{default_registry_path, RegistryError, RegistryState, RegistryStore};
