//! Who may see which share.
//!
//! Shares of one owner are kept sorted by ascending path length, so the last
//! share covering a path is the most specific one. That share alone decides
//! access: a narrow grant on `/docs/secret` overrides a wide grant on `/docs`
//! for everything at or below `/docs/secret`.

use model::{normalize_share_path, ShareItem};

use super::engine::ShareError;
use crate::registry::RegistryState;

/// A share together with the identity that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEntry {
    /// Name of the owning identity.
    pub owner: String,
    /// The share.
    pub share: ShareItem,
}

/// Every share of other identities that `viewer` may see.
///
/// Ordered by owner in registry order, then by the owner's share order.
pub fn allowed_shares_for(state: &RegistryState, viewer: &str) -> Vec<SharedEntry> {
    state
        .identities()
        .filter(|owner| !owner.is_named(viewer))
        .flat_map(|owner| {
            owner
                .shares
                .iter()
                .filter(|share| share.is_visible_to(viewer))
                .map(|share| SharedEntry {
                    owner: owner.username.clone(),
                    share: share.clone(),
                })
        })
        .collect()
}

/// Decides whether `viewer` may access `path` inside `owner`'s sandbox.
///
/// Returns the share that grants access. Fails with `NotFound` when the
/// owner is unknown or no share covers the path, and with
/// `PermissionDenied` when the governing share is not visible to `viewer`.
pub fn resolve_access(
    state: &RegistryState,
    viewer: &str,
    owner: &str,
    path: &str,
) -> Result<ShareItem, ShareError> {
    let path = normalize_share_path(path).map_err(|_| ShareError::NotFound(path.to_string()))?;
    let owner_record = state
        .find(owner)
        .ok_or_else(|| ShareError::NotFound(owner.to_string()))?;
    let share = owner_record
        .governing_share(&path)
        .ok_or_else(|| ShareError::NotFound(format!("{owner}:{path}")))?;

    if owner_record.is_named(viewer) || share.is_visible_to(viewer) {
        Ok(share.clone())
    } else {
        Err(ShareError::PermissionDenied(format!(
            "{viewer} may not access {owner}:{path}"
        )))
    }
}

/// Resolves an anonymous access token.
///
/// Only shares open to anonymous visitors resolve; a hash that exists but is
/// not externally visible behaves like an unknown one.
pub fn lookup_anonymous(state: &RegistryState, hash: &str) -> Option<SharedEntry> {
    state.identities().find_map(|owner| {
        owner
            .find_share_by_hash(hash)
            .filter(|share| share.allow_external)
            .map(|share| SharedEntry {
                owner: owner.username.clone(),
                share: share.clone(),
            })
    })
}

/// Looks up a share by hash for a registered viewer.
pub fn lookup_for_viewer(
    state: &RegistryState,
    viewer: &str,
    hash: &str,
) -> Result<SharedEntry, ShareError> {
    let (owner, share) = state
        .identities()
        .find_map(|owner| owner.find_share_by_hash(hash).map(|share| (owner, share)))
        .ok_or_else(|| ShareError::NotFound(hash.to_string()))?;

    if owner.is_named(viewer) || share.is_visible_to(viewer) || share.allow_external {
        Ok(SharedEntry {
            owner: owner.username.clone(),
            share: share.clone(),
        })
    } else {
        Err(ShareError::PermissionDenied(format!(
            "{viewer} may not access share {hash}"
        )))
    }
}
