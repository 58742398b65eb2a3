//! Manage tokens for remote client IPs.

use crc::{Crc, CRC_32_ISCSI};
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
pub const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Tokens generator.
///
/// A token is the CRC32C checksum of the requester's IPv4 address and a secret.
/// The previous secret is kept after each rotation, so tokens stay valid for
/// one to two rotation intervals, without keeping any state per requester.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
    rotation_interval: Duration,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator rotating its secret every `rotation_interval`.
    pub fn new(rotation_interval: Duration) -> Self {
        Tokens {
            prev_secret: random(),
            curr_secret: random(),
            last_updated: Instant::now(),
            rotation_interval,
        }
    }

    // === Public Methods ===

    /// Rotate the secrets if at least one interval elapsed since the last rotation.
    ///
    /// If two or more intervals elapsed, both secrets are replaced, so no token
    /// issued before that survives an idle period.
    pub fn rotate_if_due(&mut self) {
        self.rotate_if_due_at(Instant::now())
    }

    /// Validate that the token was generated with the current or the previous secret.
    pub fn validate(&self, address: SocketAddrV4, token: &[u8]) -> bool {
        let prev = generate_token(address, &self.prev_secret);
        let curr = generate_token(address, &self.curr_secret);

        token == curr || token == prev
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddrV4) -> [u8; TOKEN_SIZE] {
        generate_token(address, &self.curr_secret)
    }

    // === Private Methods ===

    fn rotate_if_due_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_updated);

        if elapsed <= self.rotation_interval {
            return;
        }

        if elapsed > self.rotation_interval.saturating_mul(2) {
            trace!(?elapsed, "Secrets expired, regenerating both");

            self.prev_secret = random();
            self.curr_secret = random();
            self.last_updated = now;
        } else {
            self.rotate_at(now);
        }
    }

    fn rotate_at(&mut self, now: Instant) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = random();

        self.last_updated = now;
    }
}

fn generate_token(address: SocketAddrV4, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    digest.update(&address.ip().octets());
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

fn random() -> [u8; SECRET_SIZE] {
    rand::random()
}

#[cfg(test)]
mod test {

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(300);

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new(INTERVAL);

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token))
    }

    #[test]
    fn token_ignores_port() {
        let tokens = Tokens::new(INTERVAL);

        let token = tokens.generate_token(SocketAddrV4::new([127, 0, 0, 1].into(), 6881));

        assert!(tokens.validate(SocketAddrV4::new([127, 0, 0, 1].into(), 1), &token));
        assert!(!tokens.validate(SocketAddrV4::new([127, 0, 0, 2].into(), 6881), &token));
    }

    #[test]
    fn tokens_survive_one_rotation() {
        let mut tokens = Tokens::new(INTERVAL);

        let address = SocketAddrV4::new([10, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        tokens.rotate_at(Instant::now());
        assert!(tokens.validate(address, &token));

        tokens.rotate_at(Instant::now());
        assert!(!tokens.validate(address, &token));
    }

    #[test]
    fn idle_rotation() {
        let address = SocketAddrV4::new([10, 0, 0, 1].into(), 6881);

        // One interval elapsed, the token is from the previous window.
        {
            let mut tokens = Tokens::new(INTERVAL);
            let token = tokens.generate_token(address);

            tokens.rotate_if_due_at(Instant::now() + INTERVAL + Duration::from_secs(1));
            assert!(tokens.validate(address, &token));
        }

        // Many intervals elapsed while idle, the token is expired.
        {
            let mut tokens = Tokens::new(INTERVAL);
            let token = tokens.generate_token(address);

            tokens.rotate_if_due_at(Instant::now() + INTERVAL * 6);
            assert!(!tokens.validate(address, &token));
        }

        // Not due yet.
        {
            let mut tokens = Tokens::new(INTERVAL);
            let token = tokens.generate_token(address);

            tokens.rotate_if_due_at(Instant::now());
            assert_eq!(tokens.generate_token(address), token);
        }
    }
}
