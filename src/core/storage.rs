//! Locally stored [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html) records.

use std::{net::SocketAddrV4, num::NonZeroUsize, time::Duration};

use lru::LruCache;
use tracing::debug;

use crate::common::{
    hash_immutable, validate_immutable, ErrorSpecific, Id, MutableError, MutableItem,
    PutMutableRequestArguments, MAX_SALT_SIZE, MAX_VALUE_SIZE,
};

use super::tokens::{Tokens, TOKEN_SIZE};

/// Default maximum number of Immutable and Mutable items to store.
pub const MAX_VALUES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A record stored at this node.
pub enum StoredRecord {
    Immutable(Box<[u8]>),
    Mutable(MutableItem),
}

#[derive(Debug)]
/// Bounded storage of immutable and mutable items, guarded by write tokens.
pub struct StorageEngine {
    tokens: Tokens,
    immutable_values: LruCache<Id, Box<[u8]>>,
    mutable_values: LruCache<Id, MutableItem>,
}

impl StorageEngine {
    /// Create a storage keeping at most `max_values` of each kind of item,
    /// and rotating its token secret every `token_rotation_interval`.
    pub fn new(max_values: usize, token_rotation_interval: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_values).unwrap_or(NonZeroUsize::MIN);

        Self {
            tokens: Tokens::new(token_rotation_interval),
            immutable_values: LruCache::new(capacity),
            mutable_values: LruCache::new(capacity),
        }
    }

    // === Tokens ===

    /// Issue a write token for this requester.
    pub fn issue_token(&mut self, requester: SocketAddrV4) -> [u8; TOKEN_SIZE] {
        self.rotate_tokens();

        self.tokens.generate_token(requester)
    }

    /// Returns `true` if the token was issued to this requester's IP
    /// within the current or the previous rotation interval.
    pub fn validate_token(&mut self, requester: SocketAddrV4, token: &[u8]) -> bool {
        self.rotate_tokens();

        self.tokens.validate(requester, token)
    }

    // === Immutable ===

    /// Store an immutable value at this node, and return its target.
    pub fn store_immutable(&mut self, value: &[u8]) -> Result<Id, StoreError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge);
        }

        let target: Id = hash_immutable(value).into();

        self.immutable_values.put(target, value.into());

        Ok(target)
    }

    /// Handle an immutable `put` request from a remote node.
    pub fn put_immutable(
        &mut self,
        requester: SocketAddrV4,
        token: &[u8],
        target: Id,
        v: Box<[u8]>,
    ) -> Result<(), StoreError> {
        if !self.validate_token(requester, token) {
            debug!(?target, ?requester, request_type = "put_immutable", "Invalid token");
            return Err(StoreError::TokenInvalid);
        }

        if v.len() > MAX_VALUE_SIZE {
            debug!(?target, ?requester, size = ?v.len(), "Message (v field) too big.");
            return Err(StoreError::ValueTooLarge);
        }

        if !validate_immutable(&v, &target) {
            debug!(?target, ?requester, "Target doesn't match the sha1 hash of v field.");
            return Err(StoreError::TargetMismatch);
        }

        self.immutable_values.put(target, v);

        Ok(())
    }

    // === Mutable ===

    /// Handle a mutable `put` request from a remote node.
    ///
    /// Checks, in order: the token, the value size, the salt size, that the target is
    /// derived from the key and salt, the signature, the CAS condition, and the sequence number.
    pub fn store_mutable(
        &mut self,
        requester: SocketAddrV4,
        token: &[u8],
        request: PutMutableRequestArguments,
    ) -> Result<(), StoreError> {
        if !self.validate_token(requester, token) {
            debug!(target = ?request.target, ?requester, request_type = "put_mutable", "Invalid token");
            return Err(StoreError::TokenInvalid);
        }

        let cas = request.cas;

        self.insert_mutable(request.into(), cas)
    }

    /// Store a mutable item without a token, applying every other check of [Self::store_mutable].
    pub fn insert_mutable(&mut self, item: MutableItem, cas: Option<i64>) -> Result<(), StoreError> {
        let target = *item.target();

        if item.value().len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge);
        }

        if let Some(salt) = item.salt() {
            if salt.len() > MAX_SALT_SIZE {
                return Err(StoreError::SaltTooLarge);
            }
        }

        item.verify().map_err(|error| {
            debug!(?target, ?error, "Invalid mutable item");

            match error {
                MutableError::TargetMismatch => StoreError::TargetMismatch,
                MutableError::InvalidSignature | MutableError::InvalidPublicKey => {
                    StoreError::BadSignature
                }
            }
        })?;

        if let Some(previous) = self.mutable_values.get(&target) {
            if let Some(cas) = cas {
                if previous.seq() != cas {
                    debug!(?target, cas, current = previous.seq(), "CAS mismatched");
                    return Err(StoreError::CasMismatch);
                }
            }

            if item.seq() <= previous.seq() {
                debug!(?target, seq = item.seq(), current = previous.seq(), "Sequence number not greater than current.");
                return Err(StoreError::StaleSequence);
            }
        }

        self.mutable_values.put(target, item);

        Ok(())
    }

    // === Lookup ===

    /// Returns the record stored for this target, if any.
    pub fn lookup(&mut self, target: &Id) -> Option<StoredRecord> {
        if let Some(item) = self.mutable_values.get(target) {
            return Some(StoredRecord::Mutable(item.clone()));
        }

        self.immutable_values
            .get(target)
            .map(|v| StoredRecord::Immutable(v.clone()))
    }

    /// Number of stored mutable and immutable items.
    pub fn len(&self) -> usize {
        self.immutable_values.len() + self.mutable_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Private Methods ===

    /// Lazily rotate secrets.
    fn rotate_tokens(&mut self) {
        self.tokens.rotate_if_due()
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a node refuses to store an item.
pub enum StoreError {
    #[error("Bad token")]
    TokenInvalid,

    #[error("Message (v field) too big.")]
    ValueTooLarge,

    #[error("Invalid signature")]
    BadSignature,

    #[error("salt (salt field) too big.")]
    SaltTooLarge,

    #[error("Target doesn't match the key or value")]
    TargetMismatch,

    #[error("CAS mismatched, re-read value and try again.")]
    CasMismatch,

    #[error("Sequence number less than current.")]
    StaleSequence,
}

impl StoreError {
    /// The KRPC error code sent back to the requester.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::TokenInvalid | StoreError::TargetMismatch => 203,
            StoreError::ValueTooLarge => 205,
            StoreError::BadSignature => 206,
            StoreError::SaltTooLarge => 207,
            StoreError::CasMismatch => 301,
            StoreError::StaleSequence => 302,
        }
    }

    /// Recognize a storage rejection in an error response from a remote node.
    pub fn from_error_response(error: &ErrorSpecific) -> Option<Self> {
        Some(match error.code {
            203 if error.description.starts_with("Target") => StoreError::TargetMismatch,
            203 => StoreError::TokenInvalid,
            205 => StoreError::ValueTooLarge,
            206 => StoreError::BadSignature,
            207 => StoreError::SaltTooLarge,
            301 => StoreError::CasMismatch,
            302 => StoreError::StaleSequence,
            _ => return None,
        })
    }
}

impl From<StoreError> for ErrorSpecific {
    fn from(error: StoreError) -> Self {
        ErrorSpecific {
            code: error.code(),
            description: error.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(300);

    fn requester() -> SocketAddrV4 {
        "10.0.0.1:6881".parse().unwrap()
    }

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[
            56, 171, 62, 85, 105, 58, 155, 209, 189, 8, 59, 109, 137, 84, 84, 201, 221, 115, 7,
            228, 127, 70, 4, 204, 182, 64, 77, 98, 92, 215, 27, 103,
        ])
    }

    fn put(
        storage: &mut StorageEngine,
        item: &MutableItem,
        cas: Option<i64>,
    ) -> Result<(), StoreError> {
        let token = storage.issue_token(requester());

        storage.store_mutable(
            requester(),
            &token,
            PutMutableRequestArguments::from(item.clone(), cas),
        )
    }

    fn stored_value(storage: &mut StorageEngine, target: &Id) -> Option<Box<[u8]>> {
        match storage.lookup(target) {
            Some(StoredRecord::Mutable(item)) => Some(item.value().into()),
            _ => None,
        }
    }

    #[test]
    fn increasing_sequence_numbers() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let signer = signer();

        let hello = MutableItem::new(&signer, b"hello", 1, None);
        let world = MutableItem::new(&signer, b"world", 2, None);

        put(&mut storage, &hello, None).unwrap();
        assert_eq!(stored_value(&mut storage, hello.target()), Some(b"hello".as_slice().into()));

        put(&mut storage, &world, None).unwrap();
        assert_eq!(stored_value(&mut storage, hello.target()), Some(b"world".as_slice().into()));
    }

    #[test]
    fn stale_sequence_is_rejected() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let signer = signer();

        let world = MutableItem::new(&signer, b"world", 2, None);
        put(&mut storage, &world, None).unwrap();

        let stale = MutableItem::new(&signer, b"stale", 1, None);
        assert_eq!(put(&mut storage, &stale, None), Err(StoreError::StaleSequence));

        let same_seq = MutableItem::new(&signer, b"other", 2, None);
        assert_eq!(put(&mut storage, &same_seq, None), Err(StoreError::StaleSequence));

        assert_eq!(stored_value(&mut storage, world.target()), Some(b"world".as_slice().into()));

        // Even the same signed item.
        assert_eq!(put(&mut storage, &world, None), Err(StoreError::StaleSequence));
        assert_eq!(stored_value(&mut storage, world.target()), Some(b"world".as_slice().into()));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let signer = signer();

        let item = MutableItem::new(&signer, b"hello", 1, None);
        let forged =
            MutableItem::new_signed_unchecked(*item.key(), [7; 64], b"hello", 1, None);

        assert_eq!(put(&mut storage, &forged, None), Err(StoreError::BadSignature));
        assert!(storage.lookup(item.target()).is_none());
    }

    #[test]
    fn invalid_token_is_rejected() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let item = MutableItem::new(&signer(), b"hello", 1, None);

        let token = storage.issue_token(requester());

        // Token issued to another IP.
        let result = storage.store_mutable(
            "10.0.0.2:6881".parse().unwrap(),
            &token,
            PutMutableRequestArguments::from(item.clone(), None),
        );
        assert_eq!(result, Err(StoreError::TokenInvalid));

        // Garbage token.
        let result = storage.store_mutable(
            requester(),
            &[0, 0, 0, 0],
            PutMutableRequestArguments::from(item.clone(), None),
        );
        assert_eq!(result, Err(StoreError::TokenInvalid));

        assert!(storage.lookup(item.target()).is_none());
    }

    #[test]
    fn size_limits() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let signer = signer();

        let big = MutableItem::new(&signer, &[0; MAX_VALUE_SIZE + 1], 1, None);
        assert_eq!(put(&mut storage, &big, None), Err(StoreError::ValueTooLarge));

        let salted = MutableItem::new(&signer, b"hello", 1, Some(&[1; MAX_SALT_SIZE + 1]));
        assert_eq!(put(&mut storage, &salted, None), Err(StoreError::SaltTooLarge));

        assert_eq!(
            storage.store_immutable(&[0; MAX_VALUE_SIZE + 1]),
            Err(StoreError::ValueTooLarge)
        );
    }

    #[test]
    fn target_must_match_key() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let item = MutableItem::new(&signer(), b"hello", 1, None);

        let token = storage.issue_token(requester());
        let mut request = PutMutableRequestArguments::from(item, None);
        request.target = Id::random();

        assert_eq!(
            storage.store_mutable(requester(), &token, request),
            Err(StoreError::TargetMismatch)
        );
    }

    #[test]
    fn compare_and_swap() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);
        let signer = signer();

        put(&mut storage, &MutableItem::new(&signer, b"one", 1, None), None).unwrap();

        let two = MutableItem::new(&signer, b"two", 2, None);
        assert_eq!(put(&mut storage, &two, Some(5)), Err(StoreError::CasMismatch));
        assert_eq!(put(&mut storage, &two, Some(1)), Ok(()));
    }

    #[test]
    fn immutable_put_and_lookup() {
        let mut storage = StorageEngine::new(MAX_VALUES, INTERVAL);

        let value: Box<[u8]> = b"did:dht:example document".as_slice().into();
        let target: Id = hash_immutable(&value).into();

        let token = storage.issue_token(requester());

        assert_eq!(
            storage.put_immutable(requester(), &token, Id::random(), value.clone()),
            Err(StoreError::TargetMismatch)
        );
        assert_eq!(
            storage.put_immutable(requester(), &[1, 2, 3, 4], target, value.clone()),
            Err(StoreError::TokenInvalid)
        );

        storage
            .put_immutable(requester(), &token, target, value.clone())
            .unwrap();

        assert_eq!(storage.lookup(&target), Some(StoredRecord::Immutable(value.clone())));
        assert_eq!(storage.store_immutable(&value), Ok(target));
    }

    #[test]
    fn bounded_by_lru() {
        let mut storage = StorageEngine::new(2, INTERVAL);

        let first = storage.store_immutable(b"1").unwrap();
        storage.store_immutable(b"2").unwrap();
        storage.store_immutable(b"3").unwrap();

        assert_eq!(storage.len(), 2);
        assert!(storage.lookup(&first).is_none());
    }

    #[test]
    fn error_codes_round_trip() {
        for error in [
            StoreError::TokenInvalid,
            StoreError::ValueTooLarge,
            StoreError::BadSignature,
            StoreError::SaltTooLarge,
            StoreError::TargetMismatch,
            StoreError::CasMismatch,
            StoreError::StaleSequence,
        ] {
            let response: ErrorSpecific = error.into();

            assert_eq!(StoreError::from_error_response(&response), Some(error));
        }

        assert_eq!(
            StoreError::from_error_response(&ErrorSpecific {
                code: 201,
                description: "Generic Error".to_string()
            }),
            None
        );
    }
}
