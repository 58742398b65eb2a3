//! Local state of a node: storage, write tokens, request handling and routing maintenance.

mod closest_nodes;
pub mod routing_maintenance;
pub mod server;
pub mod storage;
mod tokens;

pub use closest_nodes::ClosestNodes;
pub use routing_maintenance::RoutingMaintenance;
pub use server::Server;
pub use storage::{StorageEngine, StoreError, StoredRecord, MAX_VALUES};
