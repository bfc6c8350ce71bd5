//! Materializing share grants as symbolic links.
//!
//! A grant of `share` owned by `owner` appears in every eligible identity's
//! sandbox as `<viewer>/shares/<owner>/<basename>_<hash>`, pointing at
//! `<owner>/<share.path>`. These functions only touch the filesystem; the
//! caller holds the registry lock so the link set never interleaves with a
//! concurrent change of the identities it was computed from.
//!
//! Link operations are best-effort. A failure for one viewer is logged and
//! counted, and the remaining viewers are still processed. Re-running the
//! grant (or [`ShareEngine::repair`](super::ShareEngine::repair)) converges.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use model::{ShareItem, UserConfig};
use tracing::{debug, warn};

use crate::files::{home_dir, SHARES_DIR};
use crate::registry::RegistryState;

/// Counts of link operations performed by one propagation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Links created.
    pub created: usize,
    /// Links removed.
    pub removed: usize,
    /// Link operations that failed.
    pub failed: usize,
}

impl PropagationReport {
    /// Adds another report's counts to this one.
    pub fn merge(&mut self, other: PropagationReport) {
        self.created += other.created;
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Directory holding `owner`'s links inside `viewer`'s sandbox.
pub fn link_dir(storage_root: &Path, viewer: &str, owner: &str) -> PathBuf {
    home_dir(storage_root, viewer).join(SHARES_DIR).join(owner)
}

/// Absolute path of a share inside its owner's sandbox.
pub fn share_target(storage_root: &Path, owner: &str, share: &ShareItem) -> PathBuf {
    let relative = share.path.trim_start_matches('/');
    let home = home_dir(storage_root, owner);
    if relative.is_empty() {
        home
    } else {
        home.join(relative)
    }
}

/// Identities, other than the owner, that must see `share`.
///
/// `allow_local` selects every registered identity. Otherwise the allow-list
/// is resolved by name; names with no identity behind them are skipped.
pub fn eligible_viewers<'a>(
    state: &'a RegistryState,
    share: &ShareItem,
    owner: &str,
) -> Vec<&'a UserConfig> {
    if share.allow_local {
        return state.identities().filter(|u| !u.is_named(owner)).collect();
    }

    let mut viewers: Vec<&UserConfig> = Vec::new();
    for name in &share.allow_users {
        match state.find(name) {
            Some(user) if user.is_named(owner) => {}
            Some(user) => {
                if !viewers.iter().any(|v| v.is_named(&user.username)) {
                    viewers.push(user);
                }
            }
            None => warn!(
                "Share {} of {} lists unknown identity {}, skipping",
                share.path, owner, name
            ),
        }
    }
    viewers
}

/// Creates the links for `share` in every eligible identity's sandbox.
pub fn grant(
    storage_root: &Path,
    state: &RegistryState,
    share: &ShareItem,
    owner: &str,
) -> PropagationReport {
    let target = share_target(storage_root, owner, share);
    let name = share.symlink_name();
    let mut report = PropagationReport::default();

    for viewer in eligible_viewers(state, share, owner) {
        let dir = link_dir(storage_root, &viewer.username, owner);
        match create_link(&dir, &name, &target, viewer.ownership()) {
            Ok(true) => report.created += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "Failed to link share {} of {} for {}: {}",
                    share.path, owner, viewer.username, e
                );
                report.failed += 1;
            }
        }
    }
    report
}

/// Creates the link for `share` in one viewer's sandbox if it is eligible.
pub fn grant_to(
    storage_root: &Path,
    share: &ShareItem,
    owner: &str,
    viewer: &UserConfig,
) -> PropagationReport {
    let mut report = PropagationReport::default();
    if viewer.is_named(owner) || !share.is_visible_to(&viewer.username) {
        return report;
    }

    let dir = link_dir(storage_root, &viewer.username, owner);
    let target = share_target(storage_root, owner, share);
    match create_link(&dir, &share.symlink_name(), &target, viewer.ownership()) {
        Ok(true) => report.created += 1,
        Ok(false) => {}
        Err(e) => {
            warn!(
                "Failed to link share {} of {} for {}: {}",
                share.path, owner, viewer.username, e
            );
            report.failed += 1;
        }
    }
    report
}

/// Removes the links for `share` from every identity's sandbox.
///
/// Every identity is visited regardless of the share's current visibility,
/// so links left by an earlier, wider grant are removed too. Missing links
/// are ignored.
pub fn revoke(
    storage_root: &Path,
    state: &RegistryState,
    share: &ShareItem,
    owner: &str,
) -> PropagationReport {
    let name = share.symlink_name();
    let mut report = PropagationReport::default();

    for viewer in state.identities().filter(|u| !u.is_named(owner)) {
        let dir = link_dir(storage_root, &viewer.username, owner);
        match remove_link(&dir, &name) {
            Ok(true) => report.removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "Failed to unlink share {} of {} for {}: {}",
                    share.path, owner, viewer.username, e
                );
                report.failed += 1;
            }
        }
    }
    report
}

/// Removes `owner`'s whole link area from every other identity's sandbox.
///
/// Used when the owner is deleted, after its shares have been revoked, to
/// drop links and directories a previous crash may have left behind.
pub fn purge_owner(storage_root: &Path, state: &RegistryState, owner: &str) -> PropagationReport {
    let mut report = PropagationReport::default();
    for viewer in state.identities().filter(|u| !u.is_named(owner)) {
        let dir = link_dir(storage_root, &viewer.username, owner);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Failed to read link area {:?}: {}", dir, e);
                report.failed += 1;
                continue;
            }
        };
        for entry in entries.flatten() {
            let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            if !is_link {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove stale link {:?}: {}", entry.path(), e);
                    report.failed += 1;
                }
            }
        }
        let _ = fs::remove_dir(&dir);
    }
    report
}

/// Creates `dir/name -> target` unless something already exists there.
///
/// Returns whether a link was created.
fn create_link(
    dir: &Path,
    name: &str,
    target: &Path,
    owner: Option<(u32, u32)>,
) -> io::Result<bool> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        crate::files::apply_ownership(dir, owner)?;
    }

    let link = dir.join(name);
    if fs::symlink_metadata(&link).is_ok() {
        return Ok(false);
    }
    symlink(target, &link)?;
    debug!("Linked {:?} -> {:?}", link, target);
    Ok(true)
}

/// Removes `dir/name` if present, then `dir` if it became empty.
///
/// Returns whether a link was removed.
fn remove_link(dir: &Path, name: &str) -> io::Result<bool> {
    let link = dir.join(name);
    match fs::remove_file(&link) {
        Ok(()) => {
            debug!("Unlinked {:?}", link);
            let _ = fs::remove_dir(dir);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
