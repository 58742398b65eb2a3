//! Dht node.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{
    hash_immutable, FindNodeRequestArguments, GetValueRequestArguments, Id, MutableItem, Node,
    PutImmutableRequestArguments, PutMutableRequestArguments, PutRequestSpecific, Signer,
    MAX_VALUE_SIZE,
};
use crate::core::StoreError;
use crate::engine::{
    Config, GetRequestSpecific, GetResult, Info, LookupState, NodeEngine, PutError, QueryValue,
};

#[derive(Debug, Clone)]
/// Mainline Dht node.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default, Clone)]
/// A builder for [Dht] nodes.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes, as `host:port` strings.
    ///
    /// An empty list starts a new network, with this node as its first node.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = Some(bootstrap.iter().map(|b| b.to_string()).collect());

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// UDP socket request timeout duration.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Times a timed out request is resent before giving up on it.
    pub fn max_retries(&mut self, max_retries: u8) -> &mut Self {
        self.0.max_retries = max_retries;

        self
    }

    /// How often the write tokens secret is rotated.
    pub fn token_rotation_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.token_rotation_interval = interval;

        self
    }

    /// Maximum number of nodes per bucket, and of nodes to store values at.
    pub fn bucket_size(&mut self, k: usize) -> &mut Self {
        self.0.bucket_size = k;

        self
    }

    /// Number of parallel requests per lookup round.
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.0.alpha = alpha;

        self
    }

    /// Respond to requests from other nodes, or not.
    pub fn server_mode(&mut self, server_mode: bool) -> &mut Self {
        self.0.server_mode = server_mode;

        self
    }

    /// Maximum number of stored values, per kind.
    pub fn max_values(&mut self, max_values: usize) -> &mut Self {
        self.0.max_values = max_values;

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the UDP port.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let engine = NodeEngine::new(&config)?;

        thread::Builder::new()
            .name(format!("did-dht:{}", engine.local_addr()))
            .spawn(move || run(engine, receiver))?;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new DHT client that doesn't respond to requests, with default bootstrap nodes.
    pub fn client() -> Result<Self, std::io::Error> {
        Dht::builder().server_mode(false).build()
    }

    // === Getters ===

    /// Information about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.send(ActorMessage::ToBootstrap(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, releasing the UDP socket.
    ///
    /// Pending and later calls return [DhtWasShutdown].
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Cancel the lookup and the put toward `target`, dropping their in-flight requests.
    ///
    /// Callers waiting on a lookup receive an empty result, callers waiting on a put
    /// receive [PutError::Cancelled].
    pub fn cancel(&self, target: Id) -> Result<(), DhtWasShutdown> {
        self.send(ActorMessage::Cancel(target))
    }

    /// Wait until the bootstraping query is done.
    ///
    /// Returns true if the bootstraping was successful.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let info = self.info()?;
        let nodes = self.find_node(*info.id())?;

        Ok(!nodes.is_empty())
    }

    // === Find nodes ===

    /// Returns the closest responding nodes to the target.
    pub fn find_node(&self, target: Id) -> Result<Box<[Node]>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Box<[Node]>>(1);

        let request = GetRequestSpecific::FindNode(FindNodeRequestArguments { target });

        self.send(ActorMessage::Get(request, ResponseSender::ClosestNodes(sender)))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Immutable data ===

    /// Get an Immutable data by its sha1 hash.
    pub fn get_immutable(&self, target: Id) -> Result<Option<Box<[u8]>>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Box<[u8]>>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq: None,
            salt: None,
        });

        self.send(ActorMessage::Get(request, ResponseSender::Immutable(sender)))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Put an immutable data to the DHT.
    pub fn put_immutable(&self, value: &[u8]) -> Result<Id, DhtPutError> {
        let target: Id = hash_immutable(value).into();

        let request = PutRequestSpecific::PutImmutable(PutImmutableRequestArguments {
            target,
            v: value.into(),
        });

        self.put_request(request)
    }

    // === Mutable data ===

    /// Get the most recent mutable item by its public_key and optional salt.
    ///
    /// If `seq` is given, only items more recent than `seq` are returned.
    pub fn get_mutable(
        &self,
        public_key: &[u8; 32],
        salt: Option<&[u8]>,
        seq: Option<i64>,
    ) -> Result<Option<MutableItem>, DhtWasShutdown> {
        let target = MutableItem::target_from_key(public_key, salt);

        let (sender, receiver) = flume::bounded::<Option<MutableItem>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq,
            salt: salt.map(|s| s.into()),
        });

        self.send(ActorMessage::Get(request, ResponseSender::Mutable(sender)))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Put a mutable item to the DHT.
    ///
    /// If `cas` is given, nodes only overwrite an item whose `seq` equals `cas`.
    pub fn put_mutable(&self, item: MutableItem, cas: Option<i64>) -> Result<Id, DhtPutError> {
        let request = PutRequestSpecific::PutMutable(PutMutableRequestArguments::from(item, cas));

        self.put_request(request)
    }

    // === Records ===

    /// Sign a payload as a mutable item, refusing it before any network call
    /// if remote nodes would reject it for its size.
    pub fn create_put_request<S: Signer + ?Sized>(
        signer: &S,
        payload: &[u8],
        seq: i64,
    ) -> Result<MutableItem, PutError> {
        if payload.len() > MAX_VALUE_SIZE {
            return Err(PutError::Invalid(StoreError::ValueTooLarge));
        }

        Ok(MutableItem::new(signer, payload, seq, None))
    }

    /// Publish a mutable item, returning its target as a hex string.
    pub fn put(&self, item: MutableItem) -> Result<String, DhtPutError> {
        self.put_mutable(item, None).map(|target| target.to_string())
    }

    /// Resolve a record by the hex encoding of either its 20 bytes target,
    /// or the 32 bytes public key it was signed with.
    ///
    /// Mutable items are preferred over immutable values stored at the same target.
    pub fn get(&self, key: &str) -> Result<Box<[u8]>, DhtGetError> {
        let target = parse_key(key)?;

        let (sender, receiver) = flume::bounded::<Option<QueryValue>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq: None,
            salt: None,
        });

        self.send(ActorMessage::Get(request, ResponseSender::Value(sender)))?;

        match receiver.recv().map_err(|_| DhtWasShutdown)? {
            Some(QueryValue::Mutable(item)) => Ok(item.value().into()),
            Some(QueryValue::Immutable(v)) => Ok(v),
            None => Err(DhtGetError::NotFound),
        }
    }

    // === Private Methods ===

    fn put_request(&self, request: PutRequestSpecific) -> Result<Id, DhtPutError> {
        let (sender, receiver) = flume::bounded::<Result<Id, PutError>>(1);

        self.send(ActorMessage::Put(request, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    pub(crate) fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.0.send(message).map_err(|_| DhtWasShutdown)
    }
}

fn run(mut engine: NodeEngine, receiver: Receiver<ActorMessage>) {
    let mut get_senders: HashMap<Id, Vec<ResponseSender>> = HashMap::new();
    let mut put_senders: HashMap<Id, Vec<Sender<Result<Id, PutError>>>> = HashMap::new();

    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                engine.shutdown();
                drop(engine);

                let _ = sender.send(());

                break;
            }
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send(engine.info());
            }
            Ok(ActorMessage::Cancel(target)) => {
                engine.cancel(&target);

                let cancelled = GetResult {
                    closest: Box::new([]),
                    value: None,
                    state: LookupState::Failed,
                };

                for sender in get_senders.remove(&target).unwrap_or_default() {
                    sender.respond(&cancelled);
                }
                for sender in put_senders.remove(&target).unwrap_or_default() {
                    let _ = sender.send(Err(PutError::Cancelled));
                }
            }
            Ok(ActorMessage::ToBootstrap(sender)) => {
                let _ = sender.send(engine.routing_table().to_bootstrap());
            }
            Ok(ActorMessage::Get(request, sender)) => {
                let target = *request.target();

                engine.get(request);
                get_senders.entry(target).or_default().push(sender);
            }
            Ok(ActorMessage::Put(request, sender)) => {
                let target = *request.target();

                match engine.put(request) {
                    Ok(()) => put_senders.entry(target).or_default().push(sender),
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                }
            }
            Err(TryRecvError::Disconnected) => {
                debug!("All Dht handles were dropped");
                engine.shutdown();

                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        let report = engine.tick();

        for (target, result) in report.done_get_queries {
            for sender in get_senders.remove(&target).unwrap_or_default() {
                sender.respond(&result);
            }
        }

        for (target, result) in report.done_put_queries {
            for sender in put_senders.remove(&target).unwrap_or_default() {
                let _ = sender.send(result.clone());
            }
        }
    }

    info!("Dht actor loop stopped");
}

pub(crate) fn parse_key(key: &str) -> Result<Id, DhtGetError> {
    let invalid = || DhtGetError::InvalidKey(key.to_string());

    match key.len() {
        40 => key.parse().map_err(|_| invalid()),
        64 => {
            let mut public_key = [0_u8; 32];

            for (i, byte) in public_key.iter_mut().enumerate() {
                let pair = key.get(i * 2..i * 2 + 2).ok_or_else(invalid)?;
                *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
            }

            Ok(MutableItem::target_from_key(&public_key, None))
        }
        _ => Err(invalid()),
    }
}

pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<String>>),
    Get(GetRequestSpecific, ResponseSender),
    Put(PutRequestSpecific, Sender<Result<Id, PutError>>),
    Cancel(Id),
    Shutdown(Sender<()>),
}

impl std::fmt::Debug for ActorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorMessage::Info(_) => write!(f, "Info"),
            ActorMessage::ToBootstrap(_) => write!(f, "ToBootstrap"),
            ActorMessage::Get(request, _) => write!(f, "Get({request:?})"),
            ActorMessage::Put(request, _) => write!(f, "Put({:?})", request.target()),
            ActorMessage::Cancel(target) => write!(f, "Cancel({target:?})"),
            ActorMessage::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ResponseSender {
    ClosestNodes(Sender<Box<[Node]>>),
    Mutable(Sender<Option<MutableItem>>),
    Immutable(Sender<Option<Box<[u8]>>>),
    Value(Sender<Option<QueryValue>>),
}

impl ResponseSender {
    fn respond(self, result: &GetResult) {
        match self {
            ResponseSender::ClosestNodes(sender) => {
                let _ = sender.send(result.closest.clone());
            }
            ResponseSender::Mutable(sender) => {
                let _ = sender.send(match &result.value {
                    Some(QueryValue::Mutable(item)) => Some(item.clone()),
                    _ => None,
                });
            }
            ResponseSender::Immutable(sender) => {
                let _ = sender.send(match &result.value {
                    Some(QueryValue::Immutable(v)) => Some(v.clone()),
                    _ => None,
                });
            }
            ResponseSender::Value(sender) => {
                let _ = sender.send(result.value.clone());
            }
        }
    }
}

/// Create a testnet of Dht nodes to run tests against instead of the real mainline network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes on localhost, all bootstrapping from the first one.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder().port(0).bootstrap::<String>(&[]).build()?;

                let info = node.info().map_err(std::io::Error::other)?;
                let addr = SocketAddrV4::new([127, 0, 0, 1].into(), info.local_addr().port());

                bootstrap.push(addr.to_string());
                nodes.push(node)
            } else {
                let node = Dht::builder().port(0).bootstrap(&bootstrap).build()?;

                node.bootstrapped().map_err(std::io::Error::other)?;

                nodes.push(node)
            }
        }

        Ok(Self { bootstrap, nodes })
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Dht node was shutdown")]
/// The Dht node was shut down, and no longer processes requests.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Dht Put error
pub enum DhtPutError {
    #[error(transparent)]
    PutError(#[from] PutError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Dht Get error
pub enum DhtGetError {
    #[error("No value found for this key")]
    NotFound,

    #[error("Invalid key, expected 40 or 64 hex characters: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}
