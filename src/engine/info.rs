use std::net::SocketAddrV4;

use crate::common::Id;

use super::NodeEngine;

/// Information about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    server_mode: bool,
    routing_table_size: usize,
    stored_values: usize,
    pending_requests: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Returns whether or not this node is running in server mode.
    pub fn server_mode(&self) -> bool {
        self.server_mode
    }
    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of records stored for other nodes.
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
    /// Number of requests sent and still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }
}

impl From<&NodeEngine> for Info {
    fn from(engine: &NodeEngine) -> Self {
        Self {
            id: *engine.id(),
            local_addr: engine.local_addr(),
            server_mode: engine.server_mode(),
            routing_table_size: engine.routing_table().size(),
            stored_values: engine.server().storage().len(),
            pending_requests: engine.transactions.len(),
        }
    }
}
