//! # Homeshare Model Library
//!
//! This crate provides the data model shared by every Homeshare component:
//! the identities that own storage, the shares they publish, and the
//! persisted registry snapshot.
//!
//! ## Overview
//!
//! - **Identities**: [`UserConfig`] records with permission flags, salted
//!   password hashes, authorized source addresses and file ownership ids
//! - **Shares**: [`ShareItem`] grants with their stable anonymous-access hash
//!   and the deterministic link name used when a grant is materialized
//! - **Registry snapshot**: [`GlobalConfig`], the document written to disk by
//!   the registry store
//!
//! ## Layout on disk
//!
//! ```text
//! <storage root>/
//! ├── alice/                      private sandbox of "alice"
//! │   ├── docs/
//! │   └── shares/
//! │       └── bob/
//! │           └── photos_3f9a…    link -> <storage root>/bob/photos
//! └── bob/
//!     └── photos/
//! ```
//!
//! ## Modules
//!
//! - [`user`]: Identity records and password hashing
//! - [`share`]: Share grants, hashes and link names
//! - [`settings`]: Persisted registry snapshot and global settings
//! - [`error`]: Error types

pub mod error;
pub mod settings;
pub mod share;
pub mod user;

pub use error::{ModelError, Result};
pub use settings::{AuthConfig, GlobalConfig, ServerSettings, REGISTRY_FORMAT_VERSION};
pub use share::{
    generate_share_hash, hash_from_link_name, normalize_share_path, resolve_symlink_name,
    sort_shares, validate_share_hash, ShareItem, ROOT_LINK_BASENAME, SHARE_HASH_BYTES,
};
pub use user::{fold_username, hash_password, validate_username, Preference, UserConfig};
