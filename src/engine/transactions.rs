//! Track outbound requests until they get a response, time out, or get cancelled.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::common::{Id, Message, MessageType, RequestSpecific};

use super::socket::KrpcSocket;

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default number of times a timed out request is resent before failing.
pub const DEFAULT_MAX_RETRIES: u8 = 1;

type TransactionResult = Result<Message, TransactionError>;

#[derive(Debug)]
struct Transaction {
    to: SocketAddrV4,
    request: RequestSpecific,
    sent_at: Instant,
    retries_left: u8,
    sender: Sender<TransactionResult>,
}

#[derive(Debug)]
/// Inflight requests, keyed by their transaction id.
pub struct TransactionManager {
    request_timeout: Duration,
    max_retries: u8,
    pending: HashMap<u16, Transaction>,
}

/// What to do with an incoming message after matching it against pending transactions.
#[derive(Debug)]
pub enum Delivery {
    /// A request from another node, to be answered by the server.
    Request(Message),
    /// A response or an error for a pending transaction, already delivered to its [PendingQuery].
    Response {
        from: SocketAddrV4,
        responder_id: Option<Id>,
    },
    /// A response that doesn't match any pending transaction; dropped.
    Unexpected,
}

impl TransactionManager {
    pub fn new(request_timeout: Duration, max_retries: u8) -> Self {
        Self {
            request_timeout,
            max_retries,
            pending: HashMap::new(),
        }
    }

    // === Getters ===

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    // === Public Methods ===

    /// Send a request and return a [PendingQuery] resolving to its response.
    ///
    /// Dropping the [PendingQuery] cancels the transaction.
    pub fn send(
        &mut self,
        socket: &KrpcSocket,
        to: SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<PendingQuery, TransactionError> {
        if self.pending.len() > u16::MAX as usize {
            return Err(TransactionError::Saturated);
        }

        let transaction_id = self.unique_transaction_id();

        let (sender, receiver) = flume::bounded(1);

        socket.request(to, transaction_id, request.clone());

        self.pending.insert(
            transaction_id,
            Transaction {
                to,
                request,
                sent_at: Instant::now(),
                retries_left: self.max_retries,
                sender,
            },
        );

        Ok(PendingQuery {
            transaction_id,
            to,
            receiver,
        })
    }

    /// Match an incoming message against pending transactions.
    ///
    /// A response is accepted only once, and only from the address the request was sent to.
    pub fn on_message(&mut self, message: Message, from: SocketAddrV4) -> Delivery {
        if let MessageType::Request(_) = message.message_type {
            return Delivery::Request(message);
        }

        let tid = message.transaction_id;

        match self.pending.get(&tid) {
            Some(transaction) if compare_socket_addr(&transaction.to, &from) => {}
            Some(_) => {
                trace!(context = "transactions", tid, ?from, "Response from wrong address");
                return Delivery::Unexpected;
            }
            None => {
                trace!(context = "transactions", tid, ?from, "Unexpected response id");
                return Delivery::Unexpected;
            }
        };

        let responder_id = message.get_author_id();

        if let Some(transaction) = self.pending.remove(&tid) {
            // Receiver dropped means the caller is no longer interested.
            let _ = transaction.sender.send(Ok(message));
        }

        Delivery::Response { from, responder_id }
    }

    /// Drop cancelled transactions, resend expired ones that have retries left,
    /// and fail the rest with [TransactionError::Timeout].
    ///
    /// Returns the addresses of the timed out transactions.
    pub fn tick(&mut self, socket: &KrpcSocket, now: Instant) -> Vec<SocketAddrV4> {
        let mut timed_out = vec![];
        let request_timeout = self.request_timeout;

        self.pending.retain(|tid, transaction| {
            if transaction.sender.is_disconnected() {
                trace!(context = "transactions", tid, "Dropping cancelled transaction");
                return false;
            }

            if now.saturating_duration_since(transaction.sent_at) < request_timeout {
                return true;
            }

            if transaction.retries_left > 0 {
                transaction.retries_left -= 1;
                transaction.sent_at = now;

                trace!(context = "transactions", tid, to = ?transaction.to, "Retrying request");
                socket.request(transaction.to, *tid, transaction.request.clone());

                return true;
            }

            debug!(context = "transactions", tid, to = ?transaction.to, "Request timed out");

            let _ = transaction.sender.send(Err(TransactionError::Timeout));
            timed_out.push(transaction.to);

            false
        });

        timed_out
    }

    /// Fail every pending transaction with [TransactionError::Cancelled].
    pub fn cancel_all(&mut self) {
        for (_, transaction) in self.pending.drain() {
            let _ = transaction.sender.send(Err(TransactionError::Cancelled));
        }
    }

    // === Private Methods ===

    fn unique_transaction_id(&self) -> u16 {
        loop {
            let tid: u16 = rand::random();

            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }
}

#[derive(Debug)]
/// The future response of a request sent through the [TransactionManager].
pub struct PendingQuery {
    transaction_id: u16,
    to: SocketAddrV4,
    receiver: Receiver<TransactionResult>,
}

impl PendingQuery {
    #[cfg(test)]
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// The address the request was sent to.
    pub fn to(&self) -> SocketAddrV4 {
        self.to
    }

    /// Returns the result if the transaction is settled, without blocking.
    pub fn poll(&self) -> Option<TransactionResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TransactionError::Cancelled)),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors settling a transaction without a response.
pub enum TransactionError {
    #[error("Request timed out")]
    Timeout,

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Too many inflight requests")]
    Saturated,
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}
