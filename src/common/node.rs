//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::common::Id;

/// A node that wasn't heard from for this long is questionable, and gets pinged.
pub const QUESTIONABLE_TIME: Duration = Duration::from_secs(15 * 60);
/// Consecutive failed requests after which a node is considered stale, and purged.
pub const MAX_FAILED_REQUESTS: u8 = 2;

#[derive(Clone, PartialEq, Eq)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub(crate) id: Id,
    pub(crate) address: SocketAddrV4,
    pub(crate) token: Option<Box<[u8]>>,
    pub(crate) last_seen: Instant,
    pub(crate) failed_requests: u8,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("last_seen", &self.last_seen.elapsed().as_secs())
            .field("failed_requests", &self.failed_requests)
            .finish()
    }
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            token: None,
            last_seen: Instant::now(),
            failed_requests: 0,
        }
    }

    /// Creates a node with a write token received in a `get` response.
    pub(crate) fn new_with_token(id: Id, address: SocketAddrV4, token: Box<[u8]>) -> Self {
        Node {
            token: Some(token),
            ..Node::new(id, address)
        }
    }

    /// Creates a random node for testing purposes.
    #[cfg(test)]
    pub fn random() -> Node {
        Node::new(
            Id::random(),
            SocketAddrV4::new(rand::random::<u32>().into(), rand::random()),
        )
    }

    /// Creates a node with a unique address for testing purposes.
    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        Node::new(Id::random(), SocketAddrV4::new((i as u32).into(), i as u16))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    pub fn failed_requests(&self) -> u8 {
        self.failed_requests
    }

    // === Public Methods ===

    /// Returns true if this node has not failed any request since it was last seen.
    pub fn is_good(&self) -> bool {
        self.failed_requests == 0
    }

    /// Returns true if the node failed too many consecutive requests.
    pub fn is_stale(&self) -> bool {
        self.failed_requests >= MAX_FAILED_REQUESTS
    }

    /// Node is last seen more than [QUESTIONABLE_TIME] ago.
    pub fn should_ping(&self) -> bool {
        self.last_seen.elapsed() > QUESTIONABLE_TIME
    }

    pub(crate) fn same_address(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stale_after_repeated_failures() {
        let mut node = Node::random();
        assert!(node.is_good());

        node.failed_requests = 1;
        assert!(!node.is_good());
        assert!(!node.is_stale());

        node.failed_requests = MAX_FAILED_REQUESTS;
        assert!(node.is_stale());
    }

    #[test]
    fn token_from_get_response() {
        let node = Node::random();
        assert_eq!(node.token(), None);

        let node = Node::new_with_token(*node.id(), node.address(), [1, 2, 3, 4].into());
        assert_eq!(node.token(), Some([1, 2, 3, 4].as_slice()));
    }
}
