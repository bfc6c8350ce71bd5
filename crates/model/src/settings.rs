//! Persisted registry snapshot.
//!
//! [`GlobalConfig`] is the document the registry store writes to disk on every
//! persistence cycle and reads once at startup.

use std::path::PathBuf;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::user::UserConfig;

/// Version of the snapshot format (for future migrations).
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Name of the default identity created for a fresh registry.
const DEFAULT_ADMIN_NAME: &str = "admin";

/// Global server settings stored alongside the identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the protocol front-end listens on.
    pub listen_addr: String,
    /// Where the snapshot is persisted.
    pub persist_path: PathBuf,
    /// Seconds between persistence cycles.
    pub save_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            persist_path: PathBuf::from("registry.json"),
            save_interval_secs: 5,
        }
    }
}

/// Authentication settings consumed by the token layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token signing secret (hex).
    pub secret: String,
    /// Token lifetime in seconds.
    pub token_lifetime_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            secret: hex::encode(secret),
            token_lifetime_secs: 7 * 24 * 3600,
        }
    }
}

/// The full registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Snapshot format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Registered identities, in insertion order.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// The default administrator identity.
    pub default_user: UserConfig,
    /// Global settings.
    #[serde(default)]
    pub settings: ServerSettings,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_version() -> u32 {
    REGISTRY_FORMAT_VERSION
}

impl GlobalConfig {
    /// Creates an empty registry around the given default identity.
    pub fn new(default_user: UserConfig) -> Self {
        Self {
            version: REGISTRY_FORMAT_VERSION,
            users: Vec::new(),
            default_user,
            settings: ServerSettings::default(),
            auth: AuthConfig::default(),
        }
    }

    /// Parses a snapshot and restores the share ordering of every identity.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: GlobalConfig = serde_json::from_str(json)?;
        config.default_user.sort_shares();
        for user in &mut config.users {
            user.sort_shares();
        }
        Ok(config)
    }

    /// Serializes the snapshot with indentation.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The default identity followed by every registered identity.
    pub fn all_users(&self) -> impl Iterator<Item = &UserConfig> {
        std::iter::once(&self.default_user).chain(self.users.iter())
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let mut admin = UserConfig::unvalidated(DEFAULT_ADMIN_NAME);
        admin.admin = true;
        admin.can_edit = true;
        admin.can_create = true;
        Self::new(admin)
    }
}
