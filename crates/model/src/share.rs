//! Share grants.
//!
//! A share exposes a subtree of its owner's sandbox. It can be open to every
//! registered identity, to anonymous visitors, and to an explicit allow-list,
//! in any combination. Each share carries a hash that is generated once and
//! never changes while the share exists; it doubles as the anonymous-access
//! token and as the suffix of the link name materialized in other sandboxes.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Number of random bytes in a share hash (hex-encoded, so 24 characters).
pub const SHARE_HASH_BYTES: usize = 12;

/// Basename used in link names when the sandbox root itself is shared.
pub const ROOT_LINK_BASENAME: &str = "root";

/// A share published by an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShareItem {
    /// Path relative to the owner's sandbox, always starting with `/`.
    pub path: String,
    /// Visible to every registered identity.
    #[serde(default)]
    pub allow_local: bool,
    /// Visible to anonymous visitors holding the hash.
    #[serde(default)]
    pub allow_external: bool,
    /// Identities explicitly allowed to see the share.
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// Stable opaque token.
    #[serde(default)]
    pub hash: String,
}

impl ShareItem {
    /// Creates a share on `path` with no visibility and a fresh hash.
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            path: normalize_share_path(path)?,
            allow_local: false,
            allow_external: false,
            allow_users: Vec::new(),
            hash: generate_share_hash(),
        })
    }

    /// Opens the share to every registered identity.
    pub fn with_local(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    /// Opens the share to anonymous visitors.
    pub fn with_external(mut self, allow: bool) -> Self {
        self.allow_external = allow;
        self
    }

    /// Sets the explicit allow-list.
    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_users = users.into_iter().map(Into::into).collect();
        self
    }

    /// Assigns a hash if the share has none yet. An existing hash is kept.
    pub fn ensure_hash(&mut self) {
        if self.hash.is_empty() {
            self.hash = generate_share_hash();
        }
    }

    /// Whether a registered identity other than the owner may see the share.
    pub fn is_visible_to(&self, viewer: &str) -> bool {
        self.allow_local || self.is_allow_listed(viewer)
    }

    /// Whether `viewer` appears in the allow-list (case-insensitive).
    pub fn is_allow_listed(&self, viewer: &str) -> bool {
        self.allow_users
            .iter()
            .any(|name| name.eq_ignore_ascii_case(viewer))
    }

    /// Whether any registered identity at all can see the share.
    pub fn grants_registered(&self) -> bool {
        self.allow_local || !self.allow_users.is_empty()
    }

    /// Whether `path` lies at or below the shared path.
    pub fn covers(&self, path: &str) -> bool {
        if self.path == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Last segment of the shared path, or [`ROOT_LINK_BASENAME`] for `/`.
    pub fn basename(&self) -> &str {
        match self.path.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => ROOT_LINK_BASENAME,
        }
    }

    /// Link name used when this share is materialized in another sandbox.
    pub fn symlink_name(&self) -> String {
        resolve_symlink_name(self)
    }
}

/// Derives `<basename>_<hash>` for a share.
///
/// Two shares with the same basename but different hashes never collide, and
/// [`hash_from_link_name`] recovers the hash from the result.
pub fn resolve_symlink_name(share: &ShareItem) -> String {
    format!("{}_{}", share.basename(), share.hash)
}

/// Recovers the share hash from a link name produced by [`resolve_symlink_name`].
pub fn hash_from_link_name(name: &str) -> Option<&str> {
    let (_, hash) = name.rsplit_once('_')?;
    is_well_formed_hash(hash).then_some(hash)
}

/// Rejects a hash that [`generate_share_hash`] could not have produced.
pub fn validate_share_hash(hash: &str) -> Result<()> {
    if !is_well_formed_hash(hash) {
        return Err(ModelError::InvalidShareHash(hash.to_string()));
    }
    Ok(())
}

fn is_well_formed_hash(hash: &str) -> bool {
    hash.len() == SHARE_HASH_BYTES * 2 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Generates a new random share hash.
pub fn generate_share_hash() -> String {
    let mut bytes = [0u8; SHARE_HASH_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Normalizes a share path to `/a/b` form.
///
/// Empty and `.` segments are dropped, a trailing slash is removed. Paths
/// containing `..` segments or null bytes are rejected.
pub fn normalize_share_path(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(ModelError::InvalidSharePath(raw.to_string()));
    }

    let mut normalized = String::with_capacity(raw.len() + 1);
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(ModelError::InvalidSharePath(raw.to_string())),
            name => {
                normalized.push('/');
                normalized.push_str(name);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Sorts shares by ascending path length, ties broken lexicographically.
pub fn sort_shares(shares: &mut [ShareItem]) {
    shares.sort_by(|a, b| {
        a.path
            .len()
            .cmp(&b.path.len())
            .then_with(|| a.path.cmp(&b.path))
    });
}
