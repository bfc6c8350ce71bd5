//! Secondary index over the identity collection.

use std::collections::HashMap;
use std::net::IpAddr;

use model::{fold_username, GlobalConfig};

/// Where an identity lives in the registry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The default identity.
    Default,
    /// Position in the user list.
    User(usize),
}

/// Name and address lookup tables.
///
/// Rebuilt from scratch whenever the identity collection changes; never
/// patched incrementally.
#[derive(Debug, Default, Clone)]
pub struct IdentityIndex {
    /// Folded username to slot.
    by_name: HashMap<String, Slot>,
    /// Authorized source address to slot.
    by_addr: HashMap<IpAddr, Slot>,
}

impl IdentityIndex {
    /// Builds the index for a snapshot.
    ///
    /// When two identities claim the same address, the first one in
    /// registry order wins.
    pub fn build(config: &GlobalConfig) -> Self {
        let mut index = Self::default();
        index.insert(Slot::Default, &config.default_user.username, &config.default_user.ips);
        for (i, user) in config.users.iter().enumerate() {
            index.insert(Slot::User(i), &user.username, &user.ips);
        }
        index
    }

    fn insert(&mut self, slot: Slot, name: &str, ips: &[IpAddr]) {
        self.by_name.entry(fold_username(name)).or_insert(slot);
        for ip in ips {
            self.by_addr.entry(*ip).or_insert(slot);
        }
    }

    /// Looks up a name, case-insensitively.
    pub fn by_name(&self, name: &str) -> Option<Slot> {
        self.by_name.get(&fold_username(name)).copied()
    }

    /// Looks up an authorized source address.
    pub fn by_addr(&self, addr: &IpAddr) -> Option<Slot> {
        self.by_addr.get(addr).copied()
    }

    /// Number of indexed names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
