//! Node engine - I/O orchestration layer for the DHT.

pub mod config;
mod info;
mod iterative_query;
mod put_query;
pub(crate) mod socket;
pub mod transactions;

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::common::{
    FindNodeRequestArguments, GetValueRequestArguments, Id, MessageType, Node,
    PutRequestSpecific, RequestSpecific, RequestTypeSpecific, RoutingTable, MAX_SALT_SIZE,
    MAX_VALUE_SIZE,
};
use crate::core::{RoutingMaintenance, Server, StorageEngine, StoreError, StoredRecord};

use socket::KrpcSocket;
use transactions::{Delivery, PendingQuery, TransactionManager};

pub use config::{Config, DEFAULT_ALPHA, DEFAULT_BOOTSTRAP_NODES, TOKEN_ROTATE_INTERVAL};
pub use info::Info;
pub use iterative_query::{GetRequestSpecific, IterativeQuery, LookupState, QueryValue};
pub use put_query::{PutError, PutQuery};
pub use socket::DEFAULT_PORT;
pub use transactions::{TransactionError, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT};

/// Minimum time between two attempts to bootstrap an empty routing table.
const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Maximum number of incoming messages handled in a single tick.
const MAX_MESSAGES_PER_TICK: usize = 256;

#[derive(Debug)]
/// The state of a DHT node, advanced by calling [NodeEngine::tick] in a loop.
pub struct NodeEngine {
    // Options
    bootstrap: Box<[SocketAddrV4]>,
    k: usize,
    alpha: usize,

    socket: KrpcSocket,
    transactions: TransactionManager,

    // Routing
    /// Closest nodes to this node
    routing_table: RoutingTable,
    /// Routing table maintenance (refresh/ping timing)
    maintenance: RoutingMaintenance,
    last_bootstrap: Option<Instant>,

    server: Server,

    // Active IterativeQueries
    get_queries: HashMap<Id, IterativeQuery>,
    /// Put queries are special, since they have to wait for a corresponding
    /// get query to finish, to collect write tokens from the closest nodes.
    put_queries: HashMap<Id, PutQuery>,
    /// Maintenance pings, only kept to be timed out.
    pings: Vec<PendingQuery>,
}

impl NodeEngine {
    /// Creates a new NodeEngine. Does not perform network I/O; call [NodeEngine::tick] to
    /// bootstrap and run scheduled maintenance.
    pub fn new(config: &Config) -> Result<Self, std::io::Error> {
        let id = Id::random();

        let socket = KrpcSocket::new(config)?;

        info!(?id, local_addr = ?socket.local_addr(), "Listening");

        Ok(NodeEngine {
            bootstrap: config.bootstrap_addresses().into(),
            k: config.bucket_size.max(1),
            alpha: config.alpha.max(1),

            socket,
            transactions: TransactionManager::new(config.request_timeout, config.max_retries),

            routing_table: RoutingTable::with_bucket_size(id, config.bucket_size),
            maintenance: RoutingMaintenance::new(),
            last_bootstrap: None,

            server: Server::new(StorageEngine::new(
                config.max_values,
                config.token_rotation_interval,
            )),

            get_queries: HashMap::new(),
            put_queries: HashMap::new(),
            pings: Vec::new(),
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    /// Returns whether or not this node is running in server mode.
    pub fn server_mode(&self) -> bool {
        self.socket.server_mode
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing_table
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Returns a thread safe and lightweight summary of this node's information.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    /// Returns the state of the lookup toward `target`, if one is active.
    pub fn lookup_state(&self, target: &Id) -> Option<LookupState> {
        self.get_queries.get(target).map(|query| query.state())
    }

    // === Public Methods ===

    /// Advances in-flight transactions, queries and routing-table maintenance by one step.
    ///
    /// Call periodically; delays degrade query completion and routing table quality.
    pub fn tick(&mut self) -> TickReport {
        self.tick_transactions();

        self.handle_messages();

        let done_get_queries = self.tick_get_queries();

        let mut done_put_queries = self.start_put_queries(&done_get_queries);
        done_put_queries.extend(self.tick_put_queries());

        self.pings.retain(|ping| ping.poll().is_none());

        self.periodic_node_maintenance();

        TickReport {
            done_get_queries,
            done_put_queries,
        }
    }

    /// Start an iterative lookup toward the request's target, unless one is already active.
    ///
    /// The result is reported in [TickReport::done_get_queries] once the lookup is done.
    pub fn get(&mut self, request: GetRequestSpecific) {
        let target = *request.target();

        if self.get_queries.contains_key(&target) {
            return;
        }

        if target == *self.id() {
            debug!(node_id = ?target, "Bootstrapping the routing table");
        }

        let local_value = match &request {
            GetRequestSpecific::GetValue(GetValueRequestArguments { seq, .. }) => {
                match self.server.storage_mut().lookup(&target) {
                    Some(StoredRecord::Immutable(v)) => Some(QueryValue::Immutable(v)),
                    Some(StoredRecord::Mutable(item))
                        if seq.map(|seq| item.seq() > seq).unwrap_or(true) =>
                    {
                        Some(QueryValue::Mutable(item))
                    }
                    _ => None,
                }
            }
            GetRequestSpecific::FindNode(_) => None,
        };

        let mut query = IterativeQuery::new(*self.id(), request, self.k, self.alpha);

        if let Some(value) = local_value {
            query.add_local_value(value);
        }

        let routing_table_closest = self.routing_table.closest(&target);

        // If we don't have enough closest nodes, call the bootstrapping nodes too.
        if routing_table_closest.len() < self.k {
            query.bootstrap(&mut self.transactions, &self.socket, &self.bootstrap);
        }

        // Seed this query with the closest nodes we know about.
        for node in routing_table_closest.iter() {
            query.add_candidate(node.clone())
        }

        // After adding the nodes, we need to start the query.
        query.start(&mut self.transactions, &self.socket);

        self.get_queries.insert(target, query);
    }

    /// Store a value at the closest nodes to its target, after a lookup
    /// collects their write tokens.
    ///
    /// The result is reported in [TickReport::done_put_queries].
    pub fn put(&mut self, request: PutRequestSpecific) -> Result<(), PutError> {
        let target = *request.target();

        validate_put_request(&request)?;

        if let Some(existing) = self.put_queries.get(&target) {
            if existing.request() == &request {
                // Noop, the inflight query is sufficient.
                return Ok(());
            }

            debug!(?target, "Concurrent put queries for the same target");

            return Err(PutError::ConcurrentPutMutable(target));
        }

        let salt = match &request {
            PutRequestSpecific::PutMutable(args) => args.salt.clone(),
            _ => None,
        };

        self.put_queries
            .insert(target, PutQuery::new(target, request));

        self.get(GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq: None,
            salt,
        }));

        Ok(())
    }

    /// Drop the lookup toward `target` and any put query waiting on it,
    /// cancelling their in-flight requests.
    pub fn cancel(&mut self, target: &Id) {
        let cancelled_get = self.get_queries.remove(target).is_some();
        let cancelled_put = self.put_queries.remove(target).is_some();

        if cancelled_get || cancelled_put {
            debug!(?target, cancelled_get, cancelled_put, "Cancelled queries");
        }
    }

    /// Drop every query and pending transaction.
    pub fn shutdown(&mut self) {
        self.get_queries.clear();
        self.put_queries.clear();
        self.pings.clear();
        self.transactions.cancel_all();

        debug!(id = ?self.id(), "Node engine shut down");
    }

    // === Private Methods ===

    /// Retry expired requests and count the timed out ones against their nodes.
    fn tick_transactions(&mut self) {
        for address in self.transactions.tick(&self.socket, Instant::now()) {
            if self.routing_table.mark_unresponsive(address) {
                debug!(?address, "Node did not respond");
            }
        }
    }

    /// Handle incoming messages until the socket is drained.
    fn handle_messages(&mut self) {
        for _ in 0..MAX_MESSAGES_PER_TICK {
            let Some((message, from)) = self.socket.recv_from() else {
                break;
            };

            let read_only = message.read_only;

            match self.transactions.on_message(message, from) {
                Delivery::Request(message) => {
                    let transaction_id = message.transaction_id;

                    if let MessageType::Request(request) = message.message_type {
                        self.handle_request(from, transaction_id, read_only, request);
                    }
                }
                Delivery::Response {
                    from,
                    responder_id: Some(responder_id),
                } => {
                    // Only add nodes that respond to our requests.
                    if !read_only {
                        self.routing_table.add(Node::new(responder_id, from));
                    }
                }
                Delivery::Response { .. } | Delivery::Unexpected => {}
            }
        }
    }

    fn handle_request(
        &mut self,
        from: SocketAddrV4,
        transaction_id: u16,
        read_only: bool,
        request: RequestSpecific,
    ) {
        // By default we only add nodes that responds to our requests.
        //
        // This is the only exception; the first node creating the DHT,
        // without this exception, the bootstrapping node's routing table
        // will never be populated.
        if self.bootstrap.is_empty() && !read_only {
            self.routing_table
                .add(Node::new(request.requester_id, from));
        }

        if !self.server_mode() {
            return;
        }

        match self
            .server
            .handle_request(&self.routing_table, from, request)
        {
            MessageType::Response(response) => {
                self.socket.response(from, transaction_id, response)
            }
            MessageType::Error(error) => self.socket.error(from, transaction_id, error),
            MessageType::Request(_) => {}
        }
    }

    /// Advance all GET/FIND_NODE queries, remove and return done ones.
    fn tick_get_queries(&mut self) -> Vec<(Id, GetResult)> {
        let mut done = vec![];

        for (id, query) in self.get_queries.iter_mut() {
            if query.tick(&mut self.transactions, &self.socket) {
                done.push(*id);
            }
        }

        let self_id = *self.id();
        let mut done_get_queries = Vec::with_capacity(done.len());
        let mut awaiting_tokens = vec![];

        for id in done {
            let Some(query) = self.get_queries.remove(&id) else {
                continue;
            };

            if id == self_id {
                self.log_bootstrap();
            }

            // A find_node lookup can't collect the write tokens a put query needs.
            if matches!(query.request().request_type, RequestTypeSpecific::FindNode(_))
                && self
                    .put_queries
                    .get(&id)
                    .map(|put_query| !put_query.started())
                    .unwrap_or(false)
            {
                awaiting_tokens.push(id);
            }

            done_get_queries.push((
                id,
                GetResult {
                    closest: query.closest_responders(),
                    value: query.best_value(),
                    state: query.state(),
                },
            ));
        }

        for target in awaiting_tokens {
            let salt = match self.put_queries.get(&target).map(|query| query.request()) {
                Some(PutRequestSpecific::PutMutable(args)) => args.salt.clone(),
                _ => None,
            };

            debug!(?target, "Looking up write tokens for a waiting put query");

            self.get(GetRequestSpecific::GetValue(GetValueRequestArguments {
                target,
                seq: None,
                salt,
            }));
        }

        done_get_queries
    }

    /// Start put queries waiting on lookups that are done.
    fn start_put_queries(
        &mut self,
        done_get_queries: &[(Id, GetResult)],
    ) -> Vec<(Id, Result<Id, PutError>)> {
        let mut done_put_queries = vec![];
        let requester_id = *self.id();

        for (id, result) in done_get_queries {
            let Some(put_query) = self.put_queries.get_mut(id) else {
                continue;
            };

            if put_query.started() {
                continue;
            }

            // Waiting on a `get` that replaced a `find_node` lookup.
            if self.get_queries.contains_key(id) {
                continue;
            }

            if let Err(error) =
                put_query.start(&mut self.transactions, &self.socket, requester_id, &result.closest)
            {
                done_put_queries.push((*id, Err(error)));
            }
        }

        for (id, _) in done_put_queries.iter() {
            self.put_queries.remove(id);
        }

        done_put_queries
    }

    /// Advance all PUT queries, remove and return done ones.
    fn tick_put_queries(&mut self) -> Vec<(Id, Result<Id, PutError>)> {
        let mut done_put_queries = Vec::with_capacity(self.put_queries.len());

        for (id, query) in self.put_queries.iter_mut() {
            if let Some(result) = query.tick() {
                done_put_queries.push((*id, result));
            }
        }

        for (id, _) in done_put_queries.iter() {
            self.put_queries.remove(id);
        }

        done_put_queries
    }

    /// Run periodic routing-table maintenance (purge, ping, refresh, repopulate).
    fn periodic_node_maintenance(&mut self) {
        let decisions = self
            .maintenance
            .periodic_maintenance(&mut self.routing_table);

        for address in &decisions.nodes_to_ping {
            self.ping(*address);
        }

        if !decisions.purged.is_empty() || !decisions.nodes_to_ping.is_empty() {
            debug!(
                removed = decisions.purged.len(),
                pinged = decisions.nodes_to_ping.len(),
                "Node maintenance executed"
            );
        }

        for target in decisions.buckets_to_refresh {
            self.get(GetRequestSpecific::FindNode(FindNodeRequestArguments {
                target,
            }));
        }

        if decisions.should_bootstrap {
            self.populate();
        }
    }

    /// Populate routing table by asking bootstrap nodes to find ourselves,
    /// Response will allow to add closest nodes candidates to routing table.
    fn populate(&mut self) {
        if self.routing_table.is_empty() {
            if self.bootstrap.is_empty() {
                return;
            }

            let retry_is_due = self
                .last_bootstrap
                .map(|last| last.elapsed() >= BOOTSTRAP_RETRY_INTERVAL)
                .unwrap_or(true);

            if !retry_is_due {
                return;
            }
        }

        if self.get_queries.contains_key(self.id()) {
            return;
        }

        self.last_bootstrap = Some(Instant::now());

        self.get(GetRequestSpecific::FindNode(FindNodeRequestArguments {
            target: *self.id(),
        }));
    }

    /// Send a ping request to a node.
    fn ping(&mut self, address: SocketAddrV4) {
        let request = RequestSpecific {
            requester_id: *self.id(),
            request_type: RequestTypeSpecific::Ping,
        };

        match self.transactions.send(&self.socket, address, request) {
            Ok(pending) => self.pings.push(pending),
            Err(error) => debug!(?address, ?error, "Failed to ping node"),
        }
    }

    /// Check if routing table is empty and log an error if so.
    fn log_bootstrap(&self) {
        let table_size = self.routing_table.size();

        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            info!(id = ?self.id(), table_size, "Populated the routing table");
        }
    }
}

/// Refuse items that remote nodes would reject regardless of their state.
fn validate_put_request(request: &PutRequestSpecific) -> Result<(), PutError> {
    match request {
        PutRequestSpecific::PutImmutable(args) => {
            if args.v.len() > MAX_VALUE_SIZE {
                return Err(PutError::Invalid(StoreError::ValueTooLarge));
            }
        }
        PutRequestSpecific::PutMutable(args) => {
            if args.v.len() > MAX_VALUE_SIZE {
                return Err(PutError::Invalid(StoreError::ValueTooLarge));
            }
            if args.salt.as_ref().map(|s| s.len()).unwrap_or(0) > MAX_SALT_SIZE {
                return Err(PutError::Invalid(StoreError::SaltTooLarge));
            }
        }
    }

    Ok(())
}

/// Results from a single [NodeEngine::tick] call.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Completed GET and FIND_NODE queries.
    pub done_get_queries: Vec<(Id, GetResult)>,
    /// Completed PUT queries, with the stored target on success.
    pub done_put_queries: Vec<(Id, Result<Id, PutError>)>,
}

/// The outcome of a lookup.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// The closest nodes that responded, with their write tokens if any.
    pub closest: Box<[Node]>,
    /// The most recent valid value found, if the lookup was a `get`.
    pub value: Option<QueryValue>,
    /// Either [LookupState::Done] or [LookupState::Failed].
    pub state: LookupState,
}
