//! Group provisioning records and the read-only key store.
//!
//! A [`GroupConfig`] is what the provisioning collaborator hands over (group
//! identifier, 32-byte long-term key, member list). It is validated once into
//! a [`Group`]; the [`KeyStore`] is built from groups and never mutated
//! afterwards, so it can be shared between threads without locking.

use crate::error::{Error, Result};
use busseal_crypto::aead::{AeadKey, KEY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(u16);

impl GroupId {
    /// Create a group identifier.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl TryFrom<u32> for GroupId {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        u16::try_from(value)
            .map(Self)
            .map_err(|_| Error::InvalidConfig(format!("group id {value} out of range")))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node identifier on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u8);

impl NodeId {
    /// Create a node identifier.
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw key material record for one group, as loaded by provisioning.
///
/// Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct GroupConfig {
    /// Group identifier (must fit 16 bits)
    pub id: u32,
    /// Long-term key bytes (must be 32 bytes)
    pub long_term_key: Vec<u8>,
    /// Member node identifiers
    pub members: Vec<u8>,
}

impl fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConfig")
            .field("id", &self.id)
            .field("long_term_key", &"[REDACTED]")
            .field("members", &self.members)
            .finish()
    }
}

/// A validated, immutable group.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    long_term_key: AeadKey,
    members: Vec<NodeId>,
}

impl Group {
    /// Validate a provisioning record.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the identifier does not fit 16 bits,
    /// the key is not 32 bytes, or the member list is empty or has duplicates.
    pub fn from_config(config: &GroupConfig) -> Result<Self> {
        let id = GroupId::try_from(config.id)?;

        if config.long_term_key.len() != KEY_SIZE {
            return Err(Error::InvalidConfig(format!(
                "group {id}: long-term key must be {KEY_SIZE} bytes, got {}",
                config.long_term_key.len()
            )));
        }
        let long_term_key = AeadKey::from_slice(&config.long_term_key)?;

        if config.members.is_empty() {
            return Err(Error::InvalidConfig(format!("group {id}: no members")));
        }
        let mut members: Vec<NodeId> = config.members.iter().copied().map(NodeId::new).collect();
        members.sort_unstable();
        if members.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::InvalidConfig(format!(
                "group {id}: duplicate member"
            )));
        }

        Ok(Self {
            id,
            long_term_key,
            members,
        })
    }

    /// Group identifier.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Long-term key shared by all members.
    #[must_use]
    pub fn long_term_key(&self) -> &AeadKey {
        &self.long_term_key
    }

    /// Member node identifiers, sorted.
    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Whether `node` belongs to the group.
    #[must_use]
    pub fn has_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }
}

/// Read-only set of groups known to a node.
#[derive(Debug, Default)]
pub struct KeyStore {
    groups: HashMap<GroupId, Arc<Group>>,
}

impl KeyStore {
    /// Validate a single provisioning record.
    ///
    /// # Errors
    ///
    /// See [`Group::from_config`].
    pub fn load(config: &GroupConfig) -> Result<Group> {
        Group::from_config(config)
    }

    /// Build a store from provisioning records.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if any record is invalid or two records
    /// share a group identifier.
    pub fn from_configs<'a, I>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a GroupConfig>,
    {
        configs
            .into_iter()
            .map(Group::from_config)
            .collect::<Result<Vec<_>>>()
            .and_then(Self::from_groups)
    }

    /// Build a store from validated groups.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` on duplicate group identifiers.
    pub fn from_groups<I>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = Group>,
    {
        let mut map = HashMap::new();
        for group in groups {
            match map.entry(group.id()) {
                Entry::Occupied(_) => {
                    return Err(Error::InvalidConfig(format!(
                        "group {} provisioned twice",
                        group.id()
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(group));
                }
            }
        }
        Ok(Self { groups: map })
    }

    /// Look up a group.
    #[must_use]
    pub fn get(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.get(&id).cloned()
    }

    /// Groups `node` is a member of.
    pub fn groups_of(&self, node: NodeId) -> impl Iterator<Item = &Arc<Group>> + '_ {
        self.groups.values().filter(move |group| group.has_member(node))
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the store holds no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: u32, key_len: usize, members: &[u8]) -> GroupConfig {
        GroupConfig {
            id,
            long_term_key: vec![0x5A; key_len],
            members: members.to_vec(),
        }
    }

    #[test]
    fn test_load_valid_group() {
        let group = KeyStore::load(&config(1, 32, &[3, 1, 2])).unwrap();
        assert_eq!(group.id(), GroupId::new(1));
        assert_eq!(group.members(), &[NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        assert!(group.has_member(NodeId::new(2)));
        assert!(!group.has_member(NodeId::new(9)));
    }

    #[test]
    fn test_load_rejects_bad_key_length() {
        assert!(matches!(
            KeyStore::load(&config(1, 16, &[1])),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_rejects_group_id_out_of_range() {
        assert!(matches!(
            KeyStore::load(&config(70_000, 32, &[1])),
            Err(Error::InvalidConfig(_))
        ));
        assert!(KeyStore::load(&config(u32::from(u16::MAX), 32, &[1])).is_ok());
    }

    #[test]
    fn test_load_rejects_bad_members() {
        assert!(KeyStore::load(&config(1, 32, &[])).is_err());
        assert!(KeyStore::load(&config(1, 32, &[4, 4])).is_err());
    }

    #[test]
    fn test_store_rejects_duplicate_groups() {
        let configs = [config(1, 32, &[1]), config(1, 32, &[2])];
        assert!(matches!(
            KeyStore::from_configs(&configs),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_groups_of_node() {
        let configs = [config(1, 32, &[1, 2]), config(2, 32, &[2, 3]), config(3, 32, &[3])];
        let store = KeyStore::from_configs(&configs).unwrap();
        let mut ids: Vec<_> = store.groups_of(NodeId::new(2)).map(|g| g.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![GroupId::new(1), GroupId::new(2)]);
        assert_eq!(store.len(), 3);
        assert!(store.get(GroupId::new(4)).is_none());
    }

    #[test]
    fn test_config_debug_is_redacted() {
        let rendered = format!("{:?}", config(1, 32, &[1]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("90"));
    }
}
