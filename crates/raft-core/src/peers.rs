//! # peers
//!
//! why: track who else is in the consensus group and how to reach them
//! relations: owned by context.rs, read by the replication fan-out in the driver
//! what: PeerDirectory with membership ops separate from address updates

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{RaftError, Result};
use crate::PeerId;

/// Peer id to network address. An address may be absent for a peer that is
/// a member but currently unresolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    peers: BTreeMap<PeerId, Option<String>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, replacing the address if it is already known.
    pub fn add_peer(&mut self, id: impl Into<PeerId>, address: Option<String>) {
        let id = id.into();
        info!(peer = %id, address = ?address, "peer added");
        self.peers.insert(id, address);
    }

    /// Removal takes effect immediately. Returns whether the peer was a member.
    pub fn remove_peer(&mut self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        if removed {
            info!(peer = %id, "peer removed");
        }
        removed
    }

    /// Update the address of an existing member.
    pub fn set_address(&mut self, id: &str, address: impl Into<String>) -> Result<()> {
        let slot = self
            .peers
            .get_mut(id)
            .ok_or_else(|| RaftError::UnknownPeer(id.to_owned()))?;
        let address = address.into();
        info!(peer = %id, address = %address, "peer address set");
        *slot = Some(address);
        Ok(())
    }

    /// Address of `id`; none for unknown and for unresolved peers alike.
    pub fn get_address(&self, id: &str) -> Option<&str> {
        self.peers.get(id).and_then(|a| a.as_deref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn has_followers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// Members in id order with their addresses, if resolved.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.peers.iter().map(|(id, a)| (id.as_str(), a.as_deref()))
    }
}

impl<I: Into<PeerId>> FromIterator<(I, Option<String>)> for PeerDirectory {
    fn from_iter<T: IntoIterator<Item = (I, Option<String>)>>(iter: T) -> Self {
        Self {
            peers: iter.into_iter().map(|(id, a)| (id.into(), a)).collect(),
        }
    }
}
