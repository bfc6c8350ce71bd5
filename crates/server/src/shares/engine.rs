//! Share lifecycle on top of the registry.
//!
//! [`ShareEngine`] is the only place that changes shares or identities in a
//! way that affects links. Each operation takes the registry write lock,
//! updates the snapshot and then runs propagation before the lock is
//! released, so the links on disk always follow the registry state that
//! produced them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use model::{ShareItem, UserConfig};
use thiserror::Error;
use tracing::{debug, info};

use super::access::{self, SharedEntry};
use super::propagation::{self, PropagationReport};
use crate::error::ErrorKind;
use crate::files::{apply_ownership, home_dir, SandboxError, ShareView, Visitor};
use crate::registry::{RegistryError, RegistryState, RegistryStore};

/// Errors that can occur during share operations.
#[derive(Debug, Error)]
pub enum ShareError {
    /// No such identity, share or hash.
    #[error("not found: {0}")]
    NotFound(String),

    /// The owner already has a share on that path, or the identity exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The viewer may not access the share.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other registry failure.
    #[error("registry error: {0}")]
    Registry(#[source] RegistryError),

    /// The share's directory cannot be opened.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// IO error while preparing a sandbox.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ShareError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotExist,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Registry(e) => e.kind(),
            Self::Sandbox(e) => e.kind(),
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<RegistryError> for ShareError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(what) => Self::NotFound(what),
            RegistryError::AlreadyExists(what) => Self::AlreadyExists(what),
            RegistryError::PermissionDenied(what) => Self::PermissionDenied(what),
            other => Self::Registry(other),
        }
    }
}

/// Keeps share links in every sandbox in step with the registry.
#[derive(Clone)]
pub struct ShareEngine {
    /// Directory containing one sandbox per identity.
    storage_root: PathBuf,
    /// The registry the links are derived from.
    registry: Arc<RegistryStore>,
}

impl ShareEngine {
    /// Creates an engine over `storage_root`.
    pub fn new<P: AsRef<Path>>(storage_root: P, registry: Arc<RegistryStore>) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
            registry,
        }
    }

    /// Directory containing every sandbox.
    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.registry
    }

    /// Creates links for `share` of `owner` in every eligible sandbox.
    pub fn grant(&self, owner: &str, share: &ShareItem) -> Result<PropagationReport, ShareError> {
        self.registry.read(|state| {
            let owner = stored_name(state, owner)?;
            Ok(propagation::grant(&self.storage_root, state, share, &owner))
        })?
    }

    /// Removes links for `share` of `owner` from every sandbox.
    pub fn revoke(&self, owner: &str, share: &ShareItem) -> Result<PropagationReport, ShareError> {
        self.registry.read(|state| {
            let owner = stored_name(state, owner)?;
            Ok(propagation::revoke(&self.storage_root, state, share, &owner))
        })?
    }

    /// Registers a new identity, creates its sandbox and links every share
    /// already visible to it.
    pub fn add_identity(&self, user: UserConfig) -> Result<PropagationReport, ShareError> {
        let name = user.username.clone();
        let root = self.storage_root.clone();

        let (added, report) = self.registry.write(|state| {
            state.insert(user)?;
            let added = state
                .find(&name)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?;

            let mut report = PropagationReport::default();
            for share in &added.shares {
                report.merge(propagation::grant(&root, state, share, &added.username));
            }
            for owner in state.identities().filter(|u| !u.is_named(&added.username)) {
                for share in &owner.shares {
                    report.merge(propagation::grant_to(&root, share, &owner.username, &added));
                }
            }
            Ok((added, report))
        })?;

        ensure_home(&self.storage_root, &added)?;
        info!("Added identity {} ({} links created)", name, report.created);
        Ok(report)
    }

    /// Replaces an identity record and resynchronizes its shares' links.
    ///
    /// Shares that disappeared or whose visibility changed are revoked
    /// first; then every current share is granted again.
    pub fn update_identity(&self, user: UserConfig) -> Result<PropagationReport, ShareError> {
        let name = user.username.clone();
        let root = self.storage_root.clone();

        let report = self.registry.write(|state| {
            let previous = state.replace(user)?;
            let mut report = PropagationReport::default();
            let Some(current) = state.find(&name) else {
                return Ok(report);
            };

            for old in &previous.shares {
                let unchanged = current.shares.iter().any(|s| s == old);
                if !unchanged {
                    report.merge(propagation::revoke(&root, state, old, &current.username));
                }
            }
            for share in &current.shares {
                report.merge(propagation::grant(&root, state, share, &current.username));
            }
            Ok(report)
        })?;

        info!(
            "Updated identity {} ({} links created, {} removed)",
            name, report.created, report.removed
        );
        Ok(report)
    }

    /// Deletes an identity and every link its shares created.
    ///
    /// Deleting an unknown identity is a no-op.
    pub fn delete_identity(&self, name: &str) -> Result<PropagationReport, ShareError> {
        let root = self.storage_root.clone();

        let report = self.registry.write(|state| {
            let mut report = PropagationReport::default();
            let Some(removed) = state.remove(name)? else {
                return Ok(report);
            };
            for share in &removed.shares {
                report.merge(propagation::revoke(&root, state, share, &removed.username));
            }
            report.merge(propagation::purge_owner(&root, state, &removed.username));
            Ok(report)
        })?;

        if report != PropagationReport::default() {
            info!("Deleted identity {} ({} links removed)", name, report.removed);
        }
        Ok(report)
    }

    /// Adds a share to `owner` and propagates it.
    ///
    /// A hash is assigned if the share has none. Returns the stored share.
    pub fn add_share(&self, owner: &str, share: ShareItem) -> Result<ShareItem, ShareError> {
        let root = self.storage_root.clone();
        let (owner, stored, report) = self.registry.write(|state| {
            let owner = stored_name(state, owner)?;
            let stored = state.insert_share(&owner, share)?;
            let report = propagation::grant(&root, state, &stored, &owner);
            Ok((owner, stored, report))
        })?;

        info!(
            "Granted share {} of {} ({} links)",
            stored.path, owner, report.created
        );
        Ok(stored)
    }

    /// Changes the visibility of an existing share.
    ///
    /// Links from the old grant are removed and the new grant is applied.
    /// The hash is preserved.
    pub fn update_share(&self, owner: &str, share: ShareItem) -> Result<ShareItem, ShareError> {
        let root = self.storage_root.clone();
        let (owner, stored, report) = self.registry.write(|state| {
            let owner = stored_name(state, owner)?;
            let (previous, stored) = state.replace_share(&owner, share)?;
            let mut report = propagation::revoke(&root, state, &previous, &owner);
            report.merge(propagation::grant(&root, state, &stored, &owner));
            Ok((owner, stored, report))
        })?;

        info!(
            "Updated share {} of {} ({} links created, {} removed)",
            stored.path, owner, report.created, report.removed
        );
        Ok(stored)
    }

    /// Revokes and removes the share at `path`. Missing shares are a no-op.
    pub fn delete_share(&self, owner: &str, path: &str) -> Result<Option<ShareItem>, ShareError> {
        let root = self.storage_root.clone();
        let (owner, removed) = self.registry.write(|state| {
            let owner = stored_name(state, owner)?;
            let removed = state.remove_share(&owner, path)?;
            if let Some(share) = &removed {
                let report = propagation::revoke(&root, state, share, &owner);
                debug!("Revoked share {} of {}: {:?}", share.path, owner, report);
            }
            Ok((owner, removed))
        })?;

        if let Some(share) = &removed {
            info!("Deleted share {} of {}", share.path, owner);
        }
        Ok(removed)
    }

    /// Re-runs every grant, recreating links lost to an interrupted
    /// propagation.
    pub fn repair(&self) -> Result<PropagationReport, ShareError> {
        let report = self.registry.read(|state| {
            let mut report = PropagationReport::default();
            for owner in state.identities() {
                for share in &owner.shares {
                    report.merge(propagation::grant(
                        &self.storage_root,
                        state,
                        share,
                        &owner.username,
                    ));
                }
            }
            report
        })?;

        info!(
            "Repaired share links ({} created, {} failed)",
            report.created, report.failed
        );
        Ok(report)
    }

    /// Every share of other identities visible to `viewer`.
    pub fn allowed_shares_for(&self, viewer: &str) -> Result<Vec<SharedEntry>, ShareError> {
        Ok(self
            .registry
            .read(|state| access::allowed_shares_for(state, viewer))?)
    }

    /// Checks `viewer`'s access to `path` inside `owner`'s sandbox.
    pub fn resolve_access(
        &self,
        viewer: &str,
        owner: &str,
        path: &str,
    ) -> Result<ShareItem, ShareError> {
        self.registry
            .read(|state| access::resolve_access(state, viewer, owner, path))?
    }

    /// Resolves an anonymous access token.
    pub fn lookup_anonymous(&self, hash: &str) -> Result<Option<SharedEntry>, ShareError> {
        Ok(self
            .registry
            .read(|state| access::lookup_anonymous(state, hash))?)
    }

    /// Opens the share identified by `hash` for `visitor`.
    pub fn open_view(&self, visitor: &Visitor, hash: &str) -> Result<ShareView, ShareError> {
        self.registry.read(|state| {
            let entry = match visitor {
                Visitor::Anonymous => access::lookup_anonymous(state, hash)
                    .ok_or_else(|| ShareError::NotFound(hash.to_string()))?,
                Visitor::Identity(user) => {
                    access::lookup_for_viewer(state, &user.username, hash)?
                }
            };
            let owner = state
                .find(&entry.owner)
                .ok_or_else(|| ShareError::NotFound(entry.owner.clone()))?;
            Ok(ShareView::new(
                &self.storage_root,
                owner,
                &entry.share,
                visitor,
            )?)
        })?
    }
}

/// The stored spelling of an identity's name.
///
/// Names are matched case-insensitively, but link directories and targets
/// are built from the stored spelling.
fn stored_name(state: &RegistryState, name: &str) -> Result<String, RegistryError> {
    state
        .find(name)
        .map(|user| user.username.clone())
        .ok_or_else(|| RegistryError::NotFound(name.to_string()))
}

/// Creates an identity's sandbox if missing and applies its ownership.
fn ensure_home(storage_root: &Path, user: &UserConfig) -> io::Result<()> {
    let home = home_dir(storage_root, &user.username);
    if !home.exists() {
        fs::create_dir_all(&home)?;
        debug!("Created sandbox {:?}", home);
    }
    apply_ownership(&home, user.ownership())
}
