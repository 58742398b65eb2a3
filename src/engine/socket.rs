//! UDP socket layer sending and receiving KRPC messages.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific};

use super::config::Config;

const VERSION: [u8; 4] = [68, 68, 0, 1]; // "DD" version 01
const MTU: usize = 2048;

/// Port to listen on when none is configured, falling back to a random port if it is in use.
pub const DEFAULT_PORT: u16 = 20000;
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that formats DHT requests and responses.
///
/// Correlating responses to requests is left to [super::transactions::TransactionManager].
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    pub(crate) server_mode: bool,
    local_addr: SocketAddrV4,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            server_mode: config.server_mode,
            local_addr,
        })
    }

    #[cfg(test)]
    pub(crate) fn test() -> Result<Self, std::io::Error> {
        Self::new(&Config {
            port: Some(0),
            ..Default::default()
        })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request to the given address with a given transaction_id.
    pub fn request(&self, address: SocketAddrV4, transaction_id: u16, request: RequestSpecific) {
        let message = Message {
            transaction_id,
            message_type: MessageType::Request(request),
            version: Some(VERSION.into()),
            read_only: !self.server_mode,
            requester_ip: None,
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });
    }

    /// Send a response to the given address.
    pub fn response(&self, address: SocketAddrV4, transaction_id: u16, response: ResponseSpecific) {
        let message =
            self.response_message(MessageType::Response(response), address, transaction_id);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        let message = self.response_message(MessageType::Error(error), address, transaction_id);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Receives a single krpc message on the socket.
    /// On success, returns the dht message and the origin.
    ///
    /// Returns `None` and sleeps for [MAX_THREAD_BLOCK_DURATION] if there is nothing to read.
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(context = "socket_validation", "Response from port 0");
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(context = "socket_message_receiving", ?message, ?from);
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid Bencode message."
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "Received IPv6 packet");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    // === Private Methods ===

    /// Same as a request message but with request transaction_id and the requester_ip.
    fn response_message(
        &self,
        message: MessageType,
        requester_ip: SocketAddrV4,
        request_tid: u16,
    ) -> Message {
        Message {
            transaction_id: request_tid,
            message_type: message,
            version: Some(VERSION.into()),
            read_only: !self.server_mode,
            // BEP_0042 Only relevant in responses.
            requester_ip: Some(requester_ip),
        }
    }

    /// Send a raw dht message
    fn send(&self, address: SocketAddrV4, message: Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?message, ?address);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a message.
pub enum SendMessageError {
    /// Errors related to encoding DHT messages.
    #[error("Failed to encode message: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use crate::common::{Id, PingResponseArguments, RequestTypeSpecific};

    use super::*;

    fn recv(socket: &KrpcSocket) -> (Message, SocketAddrV4) {
        let start = Instant::now();

        loop {
            if let Some(received) = socket.recv_from() {
                return received;
            }

            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
        }
    }

    fn localhost(socket: &KrpcSocket) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), socket.local_addr().port())
    }

    #[test]
    fn request_response() {
        let server = KrpcSocket::test().unwrap();
        let client = KrpcSocket::test().unwrap();

        let requester_id = Id::random();

        client.request(
            localhost(&server),
            120,
            RequestSpecific {
                requester_id,
                request_type: RequestTypeSpecific::Ping,
            },
        );

        let (message, from) = recv(&server);

        assert_eq!(message.transaction_id, 120);
        assert_eq!(message.get_author_id(), Some(requester_id));
        assert_eq!(from.port(), client.local_addr().port());

        let responder_id = Id::random();
        server.response(
            from,
            message.transaction_id,
            ResponseSpecific::Ping(PingResponseArguments { responder_id }),
        );

        let (message, _) = recv(&client);

        assert_eq!(message.transaction_id, 120);
        assert_eq!(message.get_author_id(), Some(responder_id));
        assert_eq!(message.requester_ip.map(|ip| ip.port()), Some(from.port()));
        assert_eq!(message.version.as_deref(), Some(VERSION.as_slice()));
    }

    #[test]
    fn ignore_garbage() {
        let server = KrpcSocket::test().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender
            .send_to(b"d1:y1:z1:t2:aae", localhost(&server))
            .unwrap();
        sender.send_to(&[0; 10], localhost(&server)).unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(200) {
            assert!(server.recv_from().is_none());
        }
    }
}
