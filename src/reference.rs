/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identity primitives: nodes, actors, and addresses.
//!
//! A [`NodeId`] names one runtime process; it is derived once at startup
//! and is stable for the process lifetime. An [`ActorId`] names an actor
//! within one node. An [`ActorAddress`] pairs the two and carries a weak
//! reference to the implementation (a local actor or a proxy shell);
//! addresses are freely copyable and never keep an actor alive.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Weak;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::actor::ActorCell;

/// The width of a node id in bytes (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// A 160-bit value identifying one runtime process on the network.
///
/// Derived from host identity and a process identifier, plus startup
/// entropy so that repeated runs on one host do not collide. Totally
/// ordered and hashable; the all-zero value is [`NodeId::INVALID`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// The distinguished invalid node id (all zeroes).
    pub const INVALID: NodeId = NodeId([0u8; NODE_ID_LEN]);

    /// Derive a fresh node id for this process from the hostname, the
    /// process id, and startup entropy.
    pub fn derive() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()));
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(rand::thread_rng().gen::<[u8; 16]>());
        let digest = hasher.finalize();
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest[..NODE_ID_LEN]);
        Self(bytes)
    }

    /// Construct a node id from its wire representation.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The wire representation of this node id.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Tells whether this is the invalid node id.
    pub fn is_invalid(&self) -> bool {
        self == &Self::INVALID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return write!(f, "invalid-node");
        }
        // The leading 6 bytes are plenty for log readability.
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// An actor id, unique within one node. Ids are minted from a
/// monotonically increasing counter; 0 is [`ActorId::INVALID`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ActorId(pub u32);

impl ActorId {
    /// The distinguished invalid actor id.
    pub const INVALID: ActorId = ActorId(0);

    /// Tells whether this is the invalid actor id.
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The address of an actor: its `(NodeId, ActorId)` pair plus a weak
/// back reference to the implementation, when one is reachable from
/// this process.
///
/// Equality, ordering, and hashing consider only the identity pair, so
/// a resolved and an unresolved address for the same actor compare
/// equal. Upgrading the weak reference is how every send resolves its
/// target; an address whose referent is gone delivers nothing.
#[derive(Clone)]
pub struct ActorAddress {
    node: NodeId,
    id: ActorId,
    cell: Weak<dyn ActorCell>,
}

impl ActorAddress {
    /// Create an address backed by the given cell.
    pub(crate) fn new(node: NodeId, id: ActorId, cell: Weak<dyn ActorCell>) -> Self {
        Self { node, id, cell }
    }

    /// Create an address with no backing cell. Used for identities that
    /// have not (or can no longer) be resolved in this process.
    pub fn unresolved(node: NodeId, id: ActorId) -> Self {
        Self {
            node,
            id,
            cell: Weak::<crate::actor::DeadCell>::new(),
        }
    }

    /// The invalid address.
    pub fn invalid() -> Self {
        Self::unresolved(NodeId::INVALID, ActorId::INVALID)
    }

    /// The node component.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The actor component.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Tells whether this address denotes no actor at all.
    pub fn is_invalid(&self) -> bool {
        self.node.is_invalid() && self.id.is_invalid()
    }

    /// Resolve the implementation, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<dyn ActorCell>> {
        self.cell.upgrade()
    }
}

impl PartialEq for ActorAddress {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.id == other.id
    }
}

impl Eq for ActorAddress {}

impl PartialOrd for ActorAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActorAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.node, self.id).cmp(&(other.node, other.id))
    }
}

impl Hash for ActorAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "invalid-actor")
        } else {
            write!(f, "{}/{}", self.node, self.id)
        }
    }
}

impl fmt::Debug for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_derive_unique() {
        let a = NodeId::derive();
        let b = NodeId::derive();
        assert_ne!(a, b);
        assert!(!a.is_invalid());
    }

    #[test]
    fn test_node_id_roundtrip() {
        let a = NodeId::derive();
        let b = NodeId::from_bytes(*a.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_address_identity_semantics() {
        let node = NodeId::derive();
        let a = ActorAddress::unresolved(node, ActorId(7));
        let b = ActorAddress::unresolved(node, ActorId(7));
        let c = ActorAddress::unresolved(node, ActorId(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
        assert!(ActorAddress::invalid().is_invalid());
        assert!(a.upgrade().is_none());
    }
}
