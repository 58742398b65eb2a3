use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Id, MessageType, Node, PutRequest, PutRequestSpecific, RequestSpecific,
    RequestTypeSpecific,
};
use crate::core::StoreError;

use super::socket::KrpcSocket;
use super::transactions::{PendingQuery, TransactionManager};

#[derive(Debug)]
/// Once an [super::IterativeQuery] is done, we can store data at the closest nodes
/// using this PutQuery, that keeps track of acknowledging nodes, and or errors.
pub struct PutQuery {
    target: Id,
    request: PutRequestSpecific,
    /// Nodes that confirmed success
    stored_at: usize,
    /// Number of nodes the request was sent to.
    sent: usize,
    inflight: Vec<PendingQuery>,
    errors: Vec<(usize, ErrorSpecific)>,
}

impl PutQuery {
    pub fn new(target: Id, request: PutRequestSpecific) -> Self {
        Self {
            target,
            request,
            stored_at: 0,
            sent: 0,
            inflight: Vec::new(),
            errors: Vec::new(),
        }
    }

    // === Getters ===

    pub fn request(&self) -> &PutRequestSpecific {
        &self.request
    }

    pub fn started(&self) -> bool {
        self.sent > 0
    }

    // === Public Methods ===

    /// Send the put request to every node that issued a write token.
    pub fn start(
        &mut self,
        transactions: &mut TransactionManager,
        socket: &KrpcSocket,
        requester_id: Id,
        nodes: &[Node],
    ) -> Result<(), PutError> {
        let target = self.target;
        trace!(?target, "PutQuery start");

        for node in nodes {
            let Some(token) = node.token() else {
                continue;
            };

            match transactions.send(
                socket,
                node.address(),
                RequestSpecific {
                    requester_id,
                    request_type: RequestTypeSpecific::Put(PutRequest {
                        token: token.into(),
                        put_request_type: self.request.clone(),
                    }),
                },
            ) {
                Ok(pending) => {
                    self.inflight.push(pending);
                    self.sent += 1;
                }
                Err(error) => {
                    debug!(?target, address = ?node.address(), ?error, "Failed to send put request");
                }
            }
        }

        if self.sent == 0 {
            return Err(PutError::NoClosestNodes);
        }

        Ok(())
    }

    /// Process settled requests.
    ///
    /// Returns the result once every request settled. The put fails only if no node
    /// acknowledged it.
    pub fn tick(&mut self) -> Option<Result<Id, PutError>> {
        if !self.started() {
            return None;
        }

        self.poll_inflight();

        let target = self.target;

        if self.inflight.is_empty() {
            if self.stored_at == 0 {
                let most_common_error = self.most_common_error();

                debug!(
                    ?target,
                    ?most_common_error,
                    nodes_count = self.sent,
                    "Put Query: failed"
                );

                return Some(Err(self.failure()));
            }

            debug!(?target, stored_at = ?self.stored_at, "PutQuery Done successfully");

            return Some(Ok(target));
        }

        None
    }

    // === Private Methods ===

    fn poll_inflight(&mut self) {
        let mut i = 0;

        while i < self.inflight.len() {
            let Some(result) = self.inflight[i].poll() else {
                i += 1;
                continue;
            };

            let pending = self.inflight.swap_remove(i);

            match result {
                Ok(message) => match message.message_type {
                    MessageType::Response(_) => self.success(),
                    MessageType::Error(error) => self.error(error),
                    MessageType::Request(_) => {}
                },
                Err(error) => {
                    trace!(target = ?self.target, to = ?pending.to(), ?error, "Put request failed");
                }
            }
        }
    }

    fn success(&mut self) {
        debug!(target = ?self.target, "PutQuery got success response");
        self.stored_at += 1
    }

    fn error(&mut self, error: ErrorSpecific) {
        debug!(target = ?self.target, ?error, "PutQuery got error");

        if let Some(pos) = self
            .errors
            .iter()
            .position(|(_, err)| error.code == err.code)
        {
            // Increment the count of the existing error
            self.errors[pos].0 += 1;

            // Move the updated element to maintain the order (highest count first)
            let mut i = pos;
            while i > 0 && self.errors[i].0 > self.errors[i - 1].0 {
                self.errors.swap(i, i - 1);
                i -= 1;
            }
        } else {
            // Add the new error with a count of 1
            self.errors.push((1, error));
        }
    }

    fn failure(&self) -> PutError {
        match self.most_common_error() {
            Some((_, error)) => match StoreError::from_error_response(error) {
                Some(rejection) => PutError::Rejected(rejection),
                None => PutError::ErrorResponse(error.clone()),
            },
            None => PutError::Timeout,
        }
    }

    fn most_common_error(&self) -> Option<&(usize, ErrorSpecific)> {
        self.errors.first()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Put query errors
pub enum PutError {
    /// Failed to find any nodes close, usually means dht node failed to bootstrap,
    /// so the routing table is empty. Check the machine's access to UDP socket,
    /// or find better bootstrapping nodes.
    #[error("Failed to find any nodes close to store value at")]
    NoClosestNodes,

    /// No node stored the value; contains the most common rejection.
    #[error("Put rejected: {0}")]
    Rejected(StoreError),

    /// Like [PutError::Rejected] but for an error code that isn't a storage rejection.
    #[error("Query Error Response")]
    ErrorResponse(ErrorSpecific),

    /// PutQuery timed out with no responses neither success or errors
    #[error("PutQuery timed out with no responses neither success or errors")]
    Timeout,

    /// The item was refused locally before sending any request.
    #[error("Invalid item: {0}")]
    Invalid(StoreError),

    /// The put was cancelled before it settled.
    #[error("PutQuery was cancelled")]
    Cancelled,

    /// Calling [crate::Dht::put] twice for the same target with different
    /// items risks losing data.
    #[error("Concurrent PUT queries for different mutable items with the same target ({0})")]
    ConcurrentPutMutable(Id),
}
