//! Thread-safe registry of identities and their shares.
//!
//! The store keeps the whole [`GlobalConfig`] snapshot behind one
//! `RwLock` together with an [`IdentityIndex`] for name and address lookups.
//! Every public read hands out clones; mutations go through the store's
//! methods or [`RegistryStore::write`], which rebuild the index and bump a
//! dirty counter before the lock is released. The counter is drained by
//! [`RegistryStore::flush`], which the periodic persistence task calls.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use model::{
    normalize_share_path, validate_share_hash, GlobalConfig, ModelError, Preference,
    ServerSettings, ShareItem, UserConfig,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::index::{IdentityIndex, Slot};
use crate::error::ErrorKind;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No identity or share with that key.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identity or share with that key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation is not allowed on this record.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The caller may not perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A previous holder of the registry lock panicked.
    #[error("registry lock poisoned")]
    LockPoisoned,

    /// Writing the snapshot to disk failed.
    #[error("failed to persist registry to {path:?}: {source}")]
    Persistence {
        /// Destination of the snapshot.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A model value failed validation.
    #[error(transparent)]
    Invalid(#[from] ModelError),
}

impl RegistryError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotExist,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidOperation(_) | Self::Invalid(_) => ErrorKind::InvalidOperation,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::LockPoisoned | Self::Persistence { .. } => ErrorKind::Internal,
        }
    }
}

/// Returns the default registry path (`~/.config/homeshare/registry.json`).
pub fn default_registry_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("homeshare")
        .join("registry.json")
}

/// The data guarded by the registry lock.
#[derive(Debug, Clone)]
pub struct RegistryState {
    config: GlobalConfig,
    index: IdentityIndex,
}

impl RegistryState {
    /// Wraps a snapshot and indexes it.
    pub fn new(config: GlobalConfig) -> Self {
        let index = IdentityIndex::build(&config);
        Self { config, index }
    }

    /// The raw snapshot.
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Mutable access to the global settings.
    pub fn settings_mut(&mut self) -> &mut ServerSettings {
        &mut self.config.settings
    }

    /// Default identity followed by every registered identity.
    pub fn identities(&self) -> impl Iterator<Item = &UserConfig> {
        self.config.all_users()
    }

    /// Case-insensitive lookup by name.
    pub fn find(&self, name: &str) -> Option<&UserConfig> {
        self.index.by_name(name).map(|slot| self.slot(slot))
    }

    /// Lookup by authorized source address.
    pub fn find_by_addr(&self, addr: &IpAddr) -> Option<&UserConfig> {
        self.index.by_addr(addr).map(|slot| self.slot(slot))
    }

    /// Mutable lookup by name.
    ///
    /// Changing the name or addresses through the returned reference is
    /// picked up by the index rebuild at the end of [`RegistryStore::write`].
    pub fn find_mut(&mut self, name: &str) -> Option<&mut UserConfig> {
        let slot = self.index.by_name(name)?;
        Some(self.slot_mut(slot))
    }

    fn slot(&self, slot: Slot) -> &UserConfig {
        match slot {
            Slot::Default => &self.config.default_user,
            Slot::User(i) => &self.config.users[i],
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut UserConfig {
        match slot {
            Slot::Default => &mut self.config.default_user,
            Slot::User(i) => &mut self.config.users[i],
        }
    }

    /// Adds a new identity.
    pub fn insert(&mut self, mut user: UserConfig) -> Result<(), RegistryError> {
        model::validate_username(&user.username)?;
        if self.index.by_name(&user.username).is_some() {
            return Err(RegistryError::AlreadyExists(user.username));
        }
        self.prepare_shares(&mut user, None)?;
        self.config.users.push(user);
        self.rebuild_index();
        Ok(())
    }

    /// Replaces an identity record, returning the previous one.
    ///
    /// The stored spelling of the name is kept, and a share whose path the
    /// previous record already had keeps its hash.
    pub fn replace(&mut self, mut user: UserConfig) -> Result<UserConfig, RegistryError> {
        let slot = self
            .index
            .by_name(&user.username)
            .ok_or_else(|| RegistryError::NotFound(user.username.clone()))?;
        user.username.clone_from(&self.slot(slot).username);
        self.prepare_shares(&mut user, Some(self.slot(slot)))?;
        let previous = std::mem::replace(self.slot_mut(slot), user);
        self.rebuild_index();
        Ok(previous)
    }

    /// Removes an identity. Missing names are not an error.
    pub fn remove(&mut self, name: &str) -> Result<Option<UserConfig>, RegistryError> {
        match self.index.by_name(name) {
            None => Ok(None),
            Some(Slot::Default) => Err(RegistryError::InvalidOperation(format!(
                "cannot delete the default identity {name}"
            ))),
            Some(Slot::User(i)) => {
                let removed = self.config.users.remove(i);
                self.rebuild_index();
                Ok(Some(removed))
            }
        }
    }

    /// Adds a share to `owner`, assigning a hash if it has none.
    ///
    /// Returns the stored share.
    pub fn insert_share(
        &mut self,
        owner: &str,
        mut share: ShareItem,
    ) -> Result<ShareItem, RegistryError> {
        share.path = normalize_share_path(&share.path)?;
        if !share.hash.is_empty() {
            validate_share_hash(&share.hash)?;
            if self.hash_in_use(&share.hash) {
                return Err(RegistryError::AlreadyExists(share.hash));
            }
        }
        share.ensure_hash();

        let user = self
            .find_mut(owner)
            .ok_or_else(|| RegistryError::NotFound(owner.to_string()))?;
        if user.find_share(&share.path).is_some() {
            return Err(RegistryError::AlreadyExists(format!(
                "{}:{}",
                user.username, share.path
            )));
        }
        user.shares.push(share.clone());
        user.sort_shares();
        Ok(share)
    }

    /// Replaces the share at `share.path`, keeping its hash.
    ///
    /// Returns `(previous, stored)`.
    pub fn replace_share(
        &mut self,
        owner: &str,
        mut share: ShareItem,
    ) -> Result<(ShareItem, ShareItem), RegistryError> {
        share.path = normalize_share_path(&share.path)?;

        let user = self
            .find_mut(owner)
            .ok_or_else(|| RegistryError::NotFound(owner.to_string()))?;
        let existing = user
            .shares
            .iter_mut()
            .find(|s| s.path == share.path)
            .ok_or_else(|| RegistryError::NotFound(format!("{owner}:{}", share.path)))?;

        share.hash = existing.hash.clone();
        let previous = std::mem::replace(existing, share.clone());
        Ok((previous, share))
    }

    /// Removes the share at `path`. Missing shares are not an error.
    pub fn remove_share(
        &mut self,
        owner: &str,
        path: &str,
    ) -> Result<Option<ShareItem>, RegistryError> {
        let path = normalize_share_path(path)?;
        let user = self
            .find_mut(owner)
            .ok_or_else(|| RegistryError::NotFound(owner.to_string()))?;
        let position = user.shares.iter().position(|s| s.path == path);
        Ok(position.map(|i| user.shares.remove(i)))
    }

    /// Whether any identity owns a share with this hash.
    pub fn hash_in_use(&self, hash: &str) -> bool {
        self.identities()
            .any(|user| user.find_share_by_hash(hash).is_some())
    }

    /// Normalizes, checks and hashes the shares of an incoming record.
    ///
    /// Paths the `previous` record already shares keep its hash. Any other
    /// caller-supplied hash must be well formed and unused.
    fn prepare_shares(
        &self,
        user: &mut UserConfig,
        previous: Option<&UserConfig>,
    ) -> Result<(), RegistryError> {
        let mut paths = HashSet::new();
        let mut hashes = HashSet::new();
        for share in &mut user.shares {
            share.path = normalize_share_path(&share.path)?;
            if !paths.insert(share.path.clone()) {
                return Err(RegistryError::AlreadyExists(format!(
                    "{}:{}",
                    user.username, share.path
                )));
            }

            if let Some(kept) = previous.and_then(|p| p.find_share(&share.path)) {
                share.hash = kept.hash.clone();
            } else if !share.hash.is_empty() {
                validate_share_hash(&share.hash)?;
                if self.hash_in_use(&share.hash) {
                    return Err(RegistryError::AlreadyExists(share.hash.clone()));
                }
            }
            share.ensure_hash();
            if !hashes.insert(share.hash.clone()) {
                return Err(RegistryError::AlreadyExists(share.hash.clone()));
            }
        }
        user.sort_shares();
        Ok(())
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.index = IdentityIndex::build(&self.config);
    }
}

/// Thread-safe registry store.
///
/// Reads take the shared lock and return clones. Writes take the exclusive
/// lock, rebuild the index and mark the store dirty. Nothing is written to
/// disk until [`flush`](Self::flush) runs.
pub struct RegistryStore {
    /// The path to the JSON snapshot.
    path: PathBuf,
    /// Snapshot and index.
    state: RwLock<RegistryState>,
    /// Mutations since the last successful flush.
    dirty: AtomicU64,
}

impl RegistryStore {
    /// Creates a store with the built-in default snapshot.
    ///
    /// This does not touch the disk; use [`load`](Self::load) to read an
    /// existing snapshot.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(path, GlobalConfig::default())
    }

    /// Creates a store around an existing snapshot.
    pub fn with_config<P: AsRef<Path>>(path: P, config: GlobalConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(RegistryState::new(config)),
            dirty: AtomicU64::new(0),
        }
    }

    /// Loads the snapshot at `path`.
    ///
    /// A missing file yields the default snapshot, marked dirty so the first
    /// persistence cycle writes it out. An unreadable or invalid file is an
    /// error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Registry file not found at {:?}, starting with defaults", path);
            let store = Self::new(path);
            store.mark_dirty();
            return Ok(store);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry: {}", path.display()))?;
        let config = GlobalConfig::from_json(&contents)
            .with_context(|| format!("Failed to parse registry: {}", path.display()))?;

        info!(
            "Loaded {} identities from {:?}",
            config.users.len() + 1,
            path
        );
        Ok(Self::with_config(path, config))
    }

    /// Returns the path to the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` under the shared lock.
    pub fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> Result<T, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(f(&state))
    }

    /// Runs `f` under the exclusive lock.
    ///
    /// The index is rebuilt before the lock is released. The store is
    /// marked dirty when `f` succeeds.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = self.state.write().map_err(|_| RegistryError::LockPoisoned)?;
        let result = f(&mut state);
        state.rebuild_index();
        if result.is_ok() {
            self.mark_dirty();
        }
        result
    }

    /// Looks up an identity by name (case-insensitive).
    pub fn lookup_by_name(&self, name: &str) -> Result<Option<UserConfig>, RegistryError> {
        self.read(|state| state.find(name).cloned())
    }

    /// Looks up an identity by authorized source address.
    pub fn lookup_by_address(&self, addr: &IpAddr) -> Result<Option<UserConfig>, RegistryError> {
        self.read(|state| state.find_by_addr(addr).cloned())
    }

    /// Lists every identity, default first.
    pub fn list_identities(&self) -> Result<Vec<UserConfig>, RegistryError> {
        self.read(|state| state.identities().cloned().collect())
    }

    /// Returns a copy of the default identity.
    pub fn default_identity(&self) -> Result<UserConfig, RegistryError> {
        self.read(|state| state.config().default_user.clone())
    }

    /// Returns a copy of the whole snapshot.
    pub fn snapshot(&self) -> Result<GlobalConfig, RegistryError> {
        self.read(|state| state.config().clone())
    }

    /// Adds an identity.
    ///
    /// Fails with `AlreadyExists` if the name is taken, compared
    /// case-insensitively and including the default identity.
    pub fn add(&self, user: UserConfig) -> Result<(), RegistryError> {
        let name = user.username.clone();
        self.write(|state| state.insert(user))?;
        info!("Added identity {}", name);
        Ok(())
    }

    /// Replaces an identity record.
    ///
    /// Returns the previous record.
    pub fn update(&self, user: UserConfig) -> Result<UserConfig, RegistryError> {
        let name = user.username.clone();
        let previous = self.write(|state| state.replace(user))?;
        info!("Updated identity {}", name);
        Ok(previous)
    }

    /// Deletes an identity. Deleting a missing identity is a no-op.
    ///
    /// The default identity cannot be deleted.
    pub fn delete(&self, name: &str) -> Result<Option<UserConfig>, RegistryError> {
        let removed = self.write(|state| state.remove(name))?;
        if removed.is_some() {
            info!("Deleted identity {}", name);
        }
        Ok(removed)
    }

    /// Replaces the stored password hash of `name`.
    pub fn set_password(&self, name: &str, plain: &str) -> Result<(), RegistryError> {
        self.update_field(name, |user| user.set_password(plain))
    }

    /// Sets the locale of `name`.
    pub fn set_locale(&self, name: &str, locale: &str) -> Result<(), RegistryError> {
        self.update_field(name, |user| user.locale = locale.to_string())
    }

    /// Sets the listing preference of `name`.
    pub fn set_preference(&self, name: &str, preference: Preference) -> Result<(), RegistryError> {
        self.update_field(name, |user| user.preference = preference)
    }

    fn update_field(
        &self,
        name: &str,
        f: impl FnOnce(&mut UserConfig),
    ) -> Result<(), RegistryError> {
        self.write(|state| {
            let user = state
                .find_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            f(user);
            Ok(())
        })
    }

    /// Requests a save on the next persistence cycle.
    pub fn persist(&self) {
        self.mark_dirty();
    }

    /// Number of mutations not yet written to disk.
    pub fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::AcqRel);
    }

    /// Writes the snapshot if anything changed since the last flush.
    ///
    /// The dirty counter is swapped to zero first. The snapshot is
    /// serialized under the shared lock and written outside it. On failure
    /// the drained count is restored so the next call retries; the
    /// in-memory state is left as is.
    ///
    /// Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, RegistryError> {
        let pending = self.dirty.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return Ok(false);
        }

        let outcome = self
            .read(|state| state.config().to_json_pretty())
            .and_then(|serialized| serialized.map_err(RegistryError::from))
            .and_then(|contents| {
                write_atomically(&self.path, &contents).map_err(|source| {
                    RegistryError::Persistence {
                        path: self.path.clone(),
                        source,
                    }
                })
            });

        match outcome {
            Ok(()) => {
                debug!("Persisted registry to {:?} ({} changes)", self.path, pending);
                Ok(true)
            }
            Err(e) => {
                self.dirty.fetch_add(pending, Ordering::AcqRel);
                warn!("Registry persistence failed, will retry: {}", e);
                Err(e)
            }
        }
    }
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)
}
