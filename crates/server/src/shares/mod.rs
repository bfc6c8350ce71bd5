//! Share propagation and access resolution.
//!
//! Shares are materialized as symbolic links: every identity that may see a
//! share finds it under `<own sandbox>/shares/<owner>/<basename>_<hash>`.
//! Ordinary directory listing then works for shared content without any
//! special-casing. The price is that links must be created and retracted
//! explicitly whenever a grant changes, which [`ShareEngine`] does under
//! the registry write lock.
//!
//! Link operations are not transactional. A crash halfway through a
//! propagation can leave partial links; [`ShareEngine::repair`] re-runs
//! every grant to converge again.

pub mod access;
pub mod engine;
pub mod propagation;

pub use access::{allowed_shares_for, lookup_anonymous, resolve_access, SharedEntry};
pub use engine::{ShareEngine, ShareError};
pub use propagation::{link_dir, PropagationReport};
