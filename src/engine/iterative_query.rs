//! Manage iterative queries and their corresponding request/response.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use tracing::{debug, trace};

use crate::common::{
    validate_immutable, FindNodeRequestArguments, GetValueRequestArguments, Id, Message,
    MessageType, MutableItem, Node, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::core::ClosestNodes;

use super::socket::KrpcSocket;
use super::transactions::{PendingQuery, TransactionManager};

/// Progress of an [IterativeQuery].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// Waiting for the first round of responses, possibly from bootstrap addresses.
    Bootstrapping,
    /// Each settled round found a closer node, query the next `alpha` closest.
    Querying,
    /// A round found no closer node, query every remaining node among the `k` closest.
    Converging,
    /// Nothing left to query, and at least one node responded.
    Done,
    /// Nothing left to query, and no node responded.
    Failed,
}

/// Requests an [IterativeQuery] can traverse the network with.
#[derive(Debug, Clone)]
pub enum GetRequestSpecific {
    FindNode(FindNodeRequestArguments),
    GetValue(GetValueRequestArguments),
}

impl GetRequestSpecific {
    pub fn target(&self) -> &Id {
        match self {
            GetRequestSpecific::FindNode(args) => &args.target,
            GetRequestSpecific::GetValue(args) => &args.target,
        }
    }
}

/// A verified value found by an [IterativeQuery].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Immutable(Box<[u8]>),
    Mutable(MutableItem),
}

/// An iterative process of concurrently sending a request to the closest known nodes to
/// the target, adding closer nodes discovered in the responses as candidates, and
/// repeating this process until no closer nodes (that aren't already queried) are found.
#[derive(Debug)]
pub struct IterativeQuery {
    request: RequestSpecific,
    salt: Option<Box<[u8]>>,
    k: usize,
    alpha: usize,
    state: LookupState,
    /// Closest nodes according to other nodes.
    closest: ClosestNodes,
    /// Closest nodes that responded, with their write tokens if any.
    responders: ClosestNodes,
    visited: HashSet<SocketAddrV4>,
    inflight: Vec<PendingQuery>,
    /// Distance of the closest candidate when the current round started.
    round_best: Option<Id>,
    values: Vec<QueryValue>,
}

impl IterativeQuery {
    pub fn new(requester_id: Id, request: GetRequestSpecific, k: usize, alpha: usize) -> Self {
        let target = *request.target();

        let (request_type, salt) = match request {
            GetRequestSpecific::FindNode(args) => (RequestTypeSpecific::FindNode(args), None),
            GetRequestSpecific::GetValue(args) => {
                let salt = args.salt.clone();
                (RequestTypeSpecific::GetValue(args), salt)
            }
        };

        trace!(?target, ?request_type, "New Query");

        Self {
            request: RequestSpecific {
                requester_id,
                request_type,
            },
            salt,
            k: k.max(1),
            alpha: alpha.max(1),
            state: LookupState::Bootstrapping,

            closest: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),

            visited: HashSet::new(),
            inflight: Vec::new(),
            round_best: None,

            values: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.closest.target()
    }

    pub fn request(&self) -> &RequestSpecific {
        &self.request
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, LookupState::Done | LookupState::Failed)
    }

    /// The `k` closest responding nodes.
    pub fn closest_responders(&self) -> Box<[Node]> {
        self.responders.nodes().iter().take(self.k).cloned().collect()
    }

    // === Public Methods ===

    /// Add a candidate node to query if it is among the closest nodes.
    pub fn add_candidate(&mut self, node: Node) {
        if node.id() == &self.request.requester_id {
            return;
        }

        self.closest.add(node);
    }

    /// Query addresses with unknown ids, like bootstrapping nodes.
    pub fn bootstrap(
        &mut self,
        transactions: &mut TransactionManager,
        socket: &KrpcSocket,
        addresses: &[SocketAddrV4],
    ) {
        for address in addresses {
            self.visit(transactions, socket, *address);
        }
    }

    /// Add a value to the candidates, before any value received from the network.
    pub fn add_local_value(&mut self, value: QueryValue) {
        self.values.insert(0, value);
    }

    /// Start querying the closest candidates.
    pub fn start(&mut self, transactions: &mut TransactionManager, socket: &KrpcSocket) {
        self.round_best = self.best_distance();
        self.visit_next(transactions, socket, self.alpha);
    }

    /// Process settled requests, and start the next round once the current one settles.
    ///
    /// Returns true if the query is done.
    pub fn tick(&mut self, transactions: &mut TransactionManager, socket: &KrpcSocket) -> bool {
        if self.is_done() {
            return true;
        }

        self.poll_inflight();

        if !self.inflight.is_empty() {
            return false;
        }

        let best = self.best_distance();
        let improved = match (best, self.round_best) {
            (Some(best), Some(previous)) => best < previous,
            (Some(_), None) => true,
            _ => false,
        };
        self.round_best = best;

        let visited = match self.state {
            LookupState::Bootstrapping | LookupState::Querying if improved => {
                self.state = LookupState::Querying;
                self.visit_next(transactions, socket, self.alpha)
            }
            _ => {
                if self.state != LookupState::Converging {
                    trace!(target = ?self.target(), "Query converging");
                    self.state = LookupState::Converging;
                }

                self.visit_next(transactions, socket, self.k)
            }
        };

        if visited == 0 {
            self.state = if self.responders.is_empty() {
                LookupState::Failed
            } else {
                LookupState::Done
            };

            debug!(
                target = ?self.target(),
                state = ?self.state,
                candidates = ?self.closest.len(),
                visited = ?self.visited.len(),
                responders = ?self.responders.len(),
                values = ?self.values.len(),
                "Done query"
            );

            return true;
        }

        false
    }

    /// The most recent value found: the mutable item with the highest `seq`
    /// (first received on ties) that still verifies, or else the first immutable value.
    pub fn best_value(&self) -> Option<QueryValue> {
        let mut mutable = self
            .values
            .iter()
            .filter_map(|value| match value {
                QueryValue::Mutable(item) => Some(item),
                _ => None,
            })
            .collect::<Vec<_>>();

        // Stable sort keeps the first received on ties.
        mutable.sort_by(|a, b| b.seq().cmp(&a.seq()));

        for item in mutable {
            match item.verify() {
                Ok(()) => return Some(QueryValue::Mutable(item.clone())),
                Err(error) => {
                    debug!(target = ?self.target(), ?error, "Discarding invalid mutable item");
                }
            }
        }

        self.values.iter().find_map(|value| match value {
            QueryValue::Immutable(v) if validate_immutable(v, &self.target()) => {
                Some(QueryValue::Immutable(v.clone()))
            }
            _ => None,
        })
    }

    // === Private Methods ===

    fn best_distance(&self) -> Option<Id> {
        self.closest
            .nodes()
            .first()
            .map(|node| node.id().xor(&self.target()))
    }

    /// Visit up to `count` unvisited nodes among the `k` closest candidates.
    fn visit_next(
        &mut self,
        transactions: &mut TransactionManager,
        socket: &KrpcSocket,
        count: usize,
    ) -> usize {
        let to_visit = self
            .closest
            .nodes()
            .iter()
            .take(self.k)
            .filter(|node| !self.visited.contains(&node.address()))
            .take(count)
            .map(|node| node.address())
            .collect::<Vec<_>>();

        let mut visited = 0;

        for address in to_visit {
            if self.visit(transactions, socket, address) {
                visited += 1;
            }
        }

        visited
    }

    fn visit(
        &mut self,
        transactions: &mut TransactionManager,
        socket: &KrpcSocket,
        address: SocketAddrV4,
    ) -> bool {
        if !self.visited.insert(address) {
            return false;
        }

        match transactions.send(socket, address, self.request.clone()) {
            Ok(pending) => {
                self.inflight.push(pending);
                true
            }
            Err(error) => {
                debug!(target = ?self.target(), ?address, ?error, "Failed to send query request");
                false
            }
        }
    }

    fn poll_inflight(&mut self) {
        let mut i = 0;

        while i < self.inflight.len() {
            match self.inflight[i].poll() {
                None => {
                    i += 1;
                }
                Some(result) => {
                    let pending = self.inflight.swap_remove(i);

                    match result {
                        Ok(message) => self.response(pending.to(), message),
                        Err(error) => {
                            trace!(target = ?self.target(), to = ?pending.to(), ?error, "Query request failed");
                        }
                    }
                }
            }
        }
    }

    /// Store received response.
    fn response(&mut self, from: SocketAddrV4, message: Message) {
        let target = self.target();
        let responder_id = message.get_author_id();

        let (response, responder_id) = match (message.message_type, responder_id) {
            (MessageType::Response(response), Some(responder_id)) => (response, responder_id),
            (MessageType::Error(error), _) => {
                debug!(?target, ?from, ?error, "Query got error response");
                return;
            }
            _ => return,
        };

        trace!(?target, ?from, ?response, "Query got response");

        let (token, nodes): (Option<&[u8]>, Option<&[Node]>) = match &response {
            ResponseSpecific::Ping(_) => (None, None),
            ResponseSpecific::FindNode(args) => (None, Some(&args.nodes)),
            ResponseSpecific::GetImmutable(args) => (Some(&args.token), args.nodes.as_deref()),
            ResponseSpecific::GetMutable(args) => (Some(&args.token), args.nodes.as_deref()),
            ResponseSpecific::NoValues(args) => (Some(&args.token), args.nodes.as_deref()),
            ResponseSpecific::NoMoreRecentValue(args) => {
                (Some(&args.token), args.nodes.as_deref())
            }
        };

        if let Some(nodes) = nodes {
            for node in nodes {
                self.add_candidate(node.clone());
            }
        }

        self.add_candidate(Node::new(responder_id, from));

        self.responders.add(match token {
            Some(token) => Node::new_with_token(responder_id, from, token.into()),
            None => Node::new(responder_id, from),
        });

        match response {
            ResponseSpecific::GetImmutable(args) => {
                if validate_immutable(&args.v, &target) {
                    self.values.push(QueryValue::Immutable(args.v));
                } else {
                    debug!(?target, ?from, "Invalid immutable value");
                }
            }
            ResponseSpecific::GetMutable(args) => {
                match MutableItem::from_dht_message(
                    target,
                    &args.k,
                    args.v,
                    args.seq,
                    &args.sig,
                    self.salt.clone(),
                ) {
                    Ok(item) => self.values.push(QueryValue::Mutable(item)),
                    Err(error) => {
                        debug!(?target, ?from, ?error, "Invalid mutable item");
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn get_query(target: Id) -> IterativeQuery {
        IterativeQuery::new(
            Id::random(),
            GetRequestSpecific::GetValue(GetValueRequestArguments {
                target,
                seq: None,
                salt: None,
            }),
            8,
            3,
        )
    }

    #[test]
    fn skip_self_as_candidate() {
        let requester_id = Id::random();
        let mut query = IterativeQuery::new(
            requester_id,
            GetRequestSpecific::FindNode(FindNodeRequestArguments {
                target: Id::random(),
            }),
            8,
            3,
        );

        query.add_candidate(Node::new(requester_id, "10.0.0.1:6881".parse().unwrap()));
        query.add_candidate(Node::random());

        assert_eq!(query.closest.len(), 1);
    }

    #[test]
    fn highest_seq_wins() {
        let signer = SigningKey::from_bytes(&[5; 32]);

        let first = MutableItem::new(&signer, b"first", 2, None);
        let older = MutableItem::new(&signer, b"older", 1, None);
        let newest = MutableItem::new(&signer, b"newest", 3, None);
        let same_seq = MutableItem::new(&signer, b"same seq", 3, None);

        let mut query = get_query(*first.target());

        query.values.push(QueryValue::Mutable(first));
        query.values.push(QueryValue::Mutable(older));
        query.values.push(QueryValue::Mutable(newest.clone()));
        query.values.push(QueryValue::Mutable(same_seq));

        assert_eq!(query.best_value(), Some(QueryValue::Mutable(newest)));
    }

    #[test]
    fn local_value_is_first_seen() {
        let signer = SigningKey::from_bytes(&[5; 32]);

        let remote = MutableItem::new(&signer, b"remote", 3, None);
        let local = MutableItem::new(&signer, b"local", 3, None);

        let mut query = get_query(*remote.target());

        query.values.push(QueryValue::Mutable(remote));
        query.add_local_value(QueryValue::Mutable(local.clone()));

        assert_eq!(query.best_value(), Some(QueryValue::Mutable(local)));
    }

    #[test]
    fn fall_back_when_winner_does_not_verify() {
        let signer = SigningKey::from_bytes(&[5; 32]);

        let valid = MutableItem::new(&signer, b"valid", 1, None);
        let forged = MutableItem::new_signed_unchecked(
            *valid.key(),
            [0; 64],
            b"forged",
            9,
            None,
        );

        let mut query = get_query(*valid.target());

        query.values.push(QueryValue::Mutable(forged));
        query.values.push(QueryValue::Mutable(valid.clone()));

        assert_eq!(query.best_value(), Some(QueryValue::Mutable(valid)));
    }

    #[test]
    fn no_candidates_fails() {
        let socket = KrpcSocket::test().unwrap();
        let mut transactions = TransactionManager::new(std::time::Duration::from_secs(1), 1);

        let mut query = get_query(Id::random());
        query.start(&mut transactions, &socket);

        assert!(query.tick(&mut transactions, &socket));
        assert_eq!(query.state(), LookupState::Failed);
        assert!(query.best_value().is_none());
    }
}
