use std::net::{SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use crate::common::DEFAULT_BUCKET_SIZE_K;
use crate::core::storage::MAX_VALUES;

use super::transactions::{DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT};

/// Default bootstrapping nodes, used when [Config::bootstrap] is `None`.
pub const DEFAULT_BOOTSTRAP_NODES: [&str; 5] = [
    "router.magnets.im:6881",
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.nuh.dev:6881",
];

/// Default number of parallel requests per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Default interval between two rotations of the write tokens secret.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES].
    ///
    /// An empty list makes this node the first node of a new network,
    /// adding nodes that query it to its routing table.
    pub bootstrap: Option<Vec<String>>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [super::socket::DEFAULT_PORT] then any free port.
    pub port: Option<u16>,
    /// UDP socket request timeout duration.
    ///
    /// The longer this duration is, the longer queries take until they are deemeed "done".
    /// The shortet this duration is, the more responses from busy nodes we miss out on,
    /// which affects the accuracy of queries trying to find closest nodes to a target.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Times a timed out request is resent before giving up on it.
    ///
    /// Defaults to [DEFAULT_MAX_RETRIES]
    pub max_retries: u8,
    /// How often the secret write tokens are derived from is rotated.
    ///
    /// Defaults to [TOKEN_ROTATE_INTERVAL]
    pub token_rotation_interval: Duration,
    /// Maximum number of nodes in each bucket of the routing table,
    /// and number of closest nodes queried and stored at.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE_K]
    pub bucket_size: usize,
    /// Number of parallel requests per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Respond to requests from other nodes.
    ///
    /// Defaults to `true`; otherwise requests are marked read only
    /// ([BEP_0043](https://www.bittorrent.org/beps/bep_0043.html)).
    pub server_mode: bool,
    /// Maximum number of stored values, per kind (immutable and mutable).
    ///
    /// Defaults to [MAX_VALUES]
    pub max_values: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: None,
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            token_rotation_interval: TOKEN_ROTATE_INTERVAL,
            bucket_size: DEFAULT_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            server_mode: true,
            max_values: MAX_VALUES,
        }
    }
}

impl Config {
    /// Resolve the bootstrap nodes, skipping the ones that fail to resolve.
    pub(crate) fn bootstrap_addresses(&self) -> Vec<SocketAddrV4> {
        match &self.bootstrap {
            Some(bootstrap) => to_socket_address(bootstrap),
            None => to_socket_address(&DEFAULT_BOOTSTRAP_NODES),
        }
    }
}

/// Resolve `host:port` strings to IPv4 socket addresses.
pub(crate) fn to_socket_address<T: AsRef<str>>(bootstrap: &[T]) -> Vec<SocketAddrV4> {
    bootstrap
        .iter()
        .flat_map(|s| {
            s.as_ref().to_socket_addrs().map(|addrs| {
                addrs
                    .filter_map(|addr| match addr {
                        std::net::SocketAddr::V4(addr_v4) => Some(addr_v4),
                        _ => None,
                    })
                    .collect::<Box<[_]>>()
            })
        })
        .flatten()
        .collect()
}
