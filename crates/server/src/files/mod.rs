//! Sandboxed file operations.
//!
//! This module provides root-confined filesystem views:
//! - [`Sandbox`]: an identity's private storage subtree
//! - [`ShareView`]: the subtree behind a share, as seen by a visitor
//! - Recursive copy with optional ownership propagation
//!
//! # Security
//!
//! Every virtual path is cleaned lexically before use. Paths that would climb
//! above the view's root, or that contain null bytes, resolve to nothing and
//! the operation fails with `NotExist`. Symbolic links are not canonicalized:
//! share links deliberately point into other sandboxes.
//!
//! A [`ShareView`] checks every path against the owner's most specific
//! share, so a narrower share nested inside the viewed one stays hidden from
//! visitors it does not grant. A [`Sandbox`] does not: following a share
//! link under `shares/` from the viewer's own sandbox exposes the whole
//! linked subtree, nested shares included. Serve shared content that may
//! contain narrower shares through [`ShareView`].

pub mod copy;
pub mod sandbox;
pub mod vfs;
pub mod view;

pub use copy::apply_ownership;
pub use sandbox::{home_dir, AccessPolicy, Sandbox, SandboxError, SHARES_DIR};
pub use vfs::{EntryInfo, FileSystem, OpenMode};
pub use view::{ShareView, Visitor};
