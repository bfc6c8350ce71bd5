//! Identity records.

use std::net::IpAddr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ModelError, Result};
use crate::share::{sort_shares, ShareItem};

/// Prefix of stored password hashes.
const PASSWORD_SCHEME: &str = "sha256";

/// Length of the random password salt in bytes.
const PASSWORD_SALT_BYTES: usize = 16;

/// UI listing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    /// Detailed list view.
    #[default]
    List,
    /// Thumbnail grid view.
    Grid,
}

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Unique name (compared case-insensitively), also the sandbox directory name.
    pub username: String,
    /// Salted password hash, see [`hash_password`].
    #[serde(default)]
    pub password: String,
    /// Administrator flag.
    #[serde(default)]
    pub admin: bool,
    /// May modify or delete existing entries.
    #[serde(default)]
    pub can_edit: bool,
    /// May create new entries.
    #[serde(default)]
    pub can_create: bool,
    /// UI locale.
    #[serde(default = "default_locale")]
    pub locale: String,
    /// UI listing preference.
    #[serde(default)]
    pub preference: Preference,
    /// Owned shares, sorted by ascending path length.
    #[serde(default)]
    pub shares: Vec<ShareItem>,
    /// Source addresses that authenticate as this identity.
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    /// Owner id applied to created entries when positive.
    #[serde(default)]
    pub uid: i64,
    /// Group id applied to created entries when positive.
    #[serde(default)]
    pub gid: i64,
}

fn default_locale() -> String {
    "en".to_string()
}

impl UserConfig {
    /// Creates an identity with no permissions and no password.
    pub fn new(username: &str) -> Result<Self> {
        validate_username(username)?;
        Ok(Self::unvalidated(username))
    }

    /// Builds a record without checking the name.
    pub(crate) fn unvalidated(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: String::new(),
            admin: false,
            can_edit: false,
            can_create: false,
            locale: default_locale(),
            preference: Preference::default(),
            shares: Vec::new(),
            ips: Vec::new(),
            uid: 0,
            gid: 0,
        }
    }

    /// Creates an administrator with edit and create rights.
    pub fn admin(username: &str) -> Result<Self> {
        let mut user = Self::new(username)?;
        user.admin = true;
        user.can_edit = true;
        user.can_create = true;
        Ok(user)
    }

    /// Grants edit and create rights.
    pub fn with_write_access(mut self) -> Self {
        self.can_edit = true;
        self.can_create = true;
        self
    }

    /// Sets the password, storing only its salted hash.
    pub fn with_password(mut self, plain: &str) -> Self {
        self.set_password(plain);
        self
    }

    /// Replaces the stored password hash.
    pub fn set_password(&mut self, plain: &str) {
        self.password = hash_password(plain);
    }

    /// Checks a plaintext password against the stored hash.
    ///
    /// An identity without a password never verifies.
    pub fn verify_password(&self, plain: &str) -> Result<bool> {
        if self.password.is_empty() {
            return Ok(false);
        }

        let mut parts = self.password.splitn(3, '$');
        let (Some(scheme), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ModelError::MalformedPasswordHash);
        };
        if scheme != PASSWORD_SCHEME {
            return Err(ModelError::MalformedPasswordHash);
        }

        let salt = hex::decode(salt).map_err(|_| ModelError::MalformedPasswordHash)?;
        let expected = hex::decode(digest).map_err(|_| ModelError::MalformedPasswordHash)?;
        let actual = salted_digest(&salt, plain);

        Ok(constant_time_eq(&expected, &actual))
    }

    /// Case-insensitive name comparison, see [`fold_username`].
    pub fn is_named(&self, name: &str) -> bool {
        self.username.eq_ignore_ascii_case(name)
    }

    /// Owner and group ids to apply, when both are positive.
    pub fn ownership(&self) -> Option<(u32, u32)> {
        let uid = u32::try_from(self.uid).ok().filter(|id| *id > 0)?;
        let gid = u32::try_from(self.gid).ok().filter(|id| *id > 0)?;
        Some((uid, gid))
    }

    /// Finds an owned share by its exact normalized path.
    pub fn find_share(&self, path: &str) -> Option<&ShareItem> {
        self.shares.iter().find(|s| s.path == path)
    }

    /// The most specific owned share covering `path`.
    ///
    /// Relies on the ascending-path-length order of the share list.
    pub fn governing_share(&self, path: &str) -> Option<&ShareItem> {
        self.shares.iter().rev().find(|share| share.covers(path))
    }

    /// Finds an owned share by hash.
    pub fn find_share_by_hash(&self, hash: &str) -> Option<&ShareItem> {
        self.shares.iter().find(|s| s.hash == hash)
    }

    /// Restores the ascending-path-length order of the share list.
    pub fn sort_shares(&mut self) {
        sort_shares(&mut self.shares);
    }
}

/// Folds a username to its lookup key.
///
/// Only ASCII letters are folded; other characters compare exactly. Every
/// name comparison in the registry agrees with this key.
pub fn fold_username(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Rejects names that cannot serve as a sandbox directory name.
pub fn validate_username(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.chars().any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if invalid {
        return Err(ModelError::InvalidUsername(name.to_string()));
    }
    Ok(())
}

/// Hashes a password as `sha256$<salt-hex>$<digest-hex>` with a random salt.
pub fn hash_password(plain: &str) -> String {
    let mut salt = [0u8; PASSWORD_SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, plain);
    format!(
        "{}${}${}",
        PASSWORD_SCHEME,
        hex::encode(salt),
        hex::encode(digest)
    )
}

fn salted_digest(salt: &[u8], plain: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plain.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
