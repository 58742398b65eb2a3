//! Respond to incoming requests from other nodes.

use std::net::SocketAddrV4;

use tracing::debug;

use crate::common::{
    ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    GetImmutableResponseArguments, GetMutableResponseArguments, GetValueRequestArguments,
    MessageType, NoMoreRecentValueResponseArguments, NoValuesResponseArguments,
    PingResponseArguments, PutImmutableRequestArguments, PutRequest, PutRequestSpecific,
    RequestSpecific, RequestTypeSpecific, ResponseSpecific, RoutingTable,
};

use super::storage::{StorageEngine, StoredRecord};

#[derive(Debug)]
/// A server that handles incoming requests.
///
/// Supports [BEP_005](https://www.bittorrent.org/beps/bep_0005.html) `ping` and `find_node`,
/// and [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html) `get` and `put`.
///
/// But it doesn't implement any rate-limiting or blocking.
pub struct Server {
    storage: StorageEngine,
}

impl Server {
    /// Creates a new [Server] on top of a [StorageEngine].
    pub fn new(storage: StorageEngine) -> Self {
        Self { storage }
    }

    // === Getters ===

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut StorageEngine {
        &mut self.storage
    }

    // === Public Methods ===

    /// Returns a response or an error for a request.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        from: SocketAddrV4,
        request: RequestSpecific,
    ) -> MessageType {
        let responder_id = *routing_table.id();
        let requester_id = request.requester_id;

        match request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id,
                }))
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id,
                    nodes: routing_table.closest(&target),
                }))
            }
            RequestTypeSpecific::GetValue(GetValueRequestArguments { target, seq, .. }) => {
                let token: Box<[u8]> = self.storage.issue_token(from).into();
                let nodes = Some(routing_table.closest(&target));

                MessageType::Response(match self.storage.lookup(&target) {
                    Some(StoredRecord::Immutable(v)) => {
                        ResponseSpecific::GetImmutable(GetImmutableResponseArguments {
                            responder_id,
                            token,
                            nodes,
                            v,
                        })
                    }
                    Some(StoredRecord::Mutable(item)) => match seq {
                        Some(request_seq) if item.seq() <= request_seq => {
                            ResponseSpecific::NoMoreRecentValue(
                                NoMoreRecentValueResponseArguments {
                                    responder_id,
                                    token,
                                    nodes,
                                    seq: item.seq(),
                                },
                            )
                        }
                        _ => ResponseSpecific::GetMutable(GetMutableResponseArguments {
                            responder_id,
                            token,
                            nodes,
                            v: item.value().into(),
                            k: *item.key(),
                            seq: item.seq(),
                            sig: *item.signature(),
                        }),
                    },
                    None => ResponseSpecific::NoValues(NoValuesResponseArguments {
                        responder_id,
                        token,
                        nodes,
                    }),
                })
            }
            RequestTypeSpecific::Put(PutRequest {
                token,
                put_request_type,
            }) => {
                let target = *put_request_type.target();

                let result = match put_request_type {
                    PutRequestSpecific::PutImmutable(PutImmutableRequestArguments {
                        target,
                        v,
                    }) => self.storage.put_immutable(from, &token, target, v),
                    PutRequestSpecific::PutMutable(args) => {
                        self.storage.store_mutable(from, &token, args)
                    }
                };

                match result {
                    Ok(()) => MessageType::Response(ResponseSpecific::Ping(
                        PingResponseArguments { responder_id },
                    )),
                    Err(error) => {
                        debug!(?target, ?requester_id, ?from, ?error, "Rejected put request");

                        MessageType::Error(ErrorSpecific::from(error))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use crate::common::{Id, MutableItem, Node, PutMutableRequestArguments};
    use crate::core::storage::MAX_VALUES;

    use super::*;

    fn server() -> (Server, RoutingTable) {
        let server = Server::new(StorageEngine::new(MAX_VALUES, Duration::from_secs(300)));

        let mut routing_table = RoutingTable::new(Id::random());
        for i in 0..20 {
            routing_table.add(Node::unique(i));
        }

        (server, routing_table)
    }

    fn request(request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific {
            requester_id: Id::random(),
            request_type,
        }
    }

    fn get_token(
        server: &mut Server,
        routing_table: &RoutingTable,
        from: SocketAddrV4,
        target: Id,
    ) -> Box<[u8]> {
        match server.handle_request(
            routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                target,
                seq: None,
                salt: None,
            })),
        ) {
            MessageType::Response(ResponseSpecific::NoValues(args)) => args.token,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn ping_and_find_node() {
        let (mut server, routing_table) = server();
        let from: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();

        assert_eq!(
            server.handle_request(&routing_table, from, request(RequestTypeSpecific::Ping)),
            MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: *routing_table.id()
            }))
        );

        let target = Id::random();

        match server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                target,
            })),
        ) {
            MessageType::Response(ResponseSpecific::FindNode(args)) => {
                assert_eq!(args.nodes, routing_table.closest(&target));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn put_then_get_mutable() {
        let (mut server, routing_table) = server();
        let from: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();

        let signer = SigningKey::from_bytes(&[3; 32]);
        let item = MutableItem::new(&signer, b"hello", 7, None);
        let target = *item.target();

        let token = get_token(&mut server, &routing_table, from, target);

        let response = server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::Put(PutRequest {
                token,
                put_request_type: PutRequestSpecific::PutMutable(
                    PutMutableRequestArguments::from(item.clone(), None),
                ),
            })),
        );
        assert!(matches!(
            response,
            MessageType::Response(ResponseSpecific::Ping(_))
        ));

        match server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                target,
                seq: None,
                salt: None,
            })),
        ) {
            MessageType::Response(ResponseSpecific::GetMutable(args)) => {
                assert_eq!(&*args.v, b"hello");
                assert_eq!(args.seq, 7);
                assert_eq!(&args.k, item.key());
                assert_eq!(&args.sig, item.signature());
            }
            other => panic!("unexpected response {other:?}"),
        }

        match server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                target,
                seq: Some(7),
                salt: None,
            })),
        ) {
            MessageType::Response(ResponseSpecific::NoMoreRecentValue(args)) => {
                assert_eq!(args.seq, 7);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn put_with_bad_token_is_an_error() {
        let (mut server, routing_table) = server();
        let from: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();

        let item = MutableItem::new(&SigningKey::from_bytes(&[3; 32]), b"hello", 7, None);

        let response = server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::Put(PutRequest {
                token: [0, 0, 0, 0].into(),
                put_request_type: PutRequestSpecific::PutMutable(
                    PutMutableRequestArguments::from(item, None),
                ),
            })),
        );

        match response {
            MessageType::Error(error) => assert_eq!(error.code, 203),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
