//! Helper functions and structs for mutable items.

use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use sha1_smol::Sha1;

use super::{Id, PutMutableRequestArguments};

/// Maximum size of the optional salt in bytes.
pub const MAX_SALT_SIZE: usize = 64;

/// A signing capability for [MutableItem]s.
///
/// [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html) mandates ed25519,
/// which is implemented for [SigningKey], but tests and callers holding keys in
/// external devices can provide their own.
pub trait Signer {
    /// The 32 bytes public key that remote nodes verify signatures with.
    fn public_key(&self) -> [u8; 32];

    /// Sign a message, returning a 64 bytes signature.
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

impl Signer for SigningKey {
    fn public_key(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        ed25519_dalek::Signer::sign(self, message).to_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html)'s Mutable item.
pub struct MutableItem {
    /// hash of the key and optional salt
    target: Id,
    /// ed25519 public key
    key: [u8; 32],
    /// sequence number
    seq: i64,
    /// mutable value
    value: Box<[u8]>,
    /// ed25519 signature
    signature: [u8; 64],
    /// Optional salt
    salt: Option<Box<[u8]>>,
}

impl MutableItem {
    /// Create a new mutable item from a signer, value, sequence number and optional salt.
    pub fn new<S: Signer + ?Sized>(signer: &S, value: &[u8], seq: i64, salt: Option<&[u8]>) -> Self {
        let signable = encode_signable(seq, value, salt);
        let signature = signer.sign(&signable);

        Self::new_signed_unchecked(signer.public_key(), signature, value, seq, salt)
    }

    /// Return the target of a [MutableItem] by hashing its `public_key` and an optional `salt`
    pub fn target_from_key(public_key: &[u8; 32], salt: Option<&[u8]>) -> Id {
        let mut hasher = Sha1::new();

        hasher.update(public_key);

        if let Some(salt) = salt {
            hasher.update(salt);
        }

        hasher.digest().bytes().into()
    }

    /// Create a new mutable item from an already signed value.
    pub fn new_signed_unchecked(
        key: [u8; 32],
        signature: [u8; 64],
        value: &[u8],
        seq: i64,
        salt: Option<&[u8]>,
    ) -> Self {
        Self {
            target: MutableItem::target_from_key(&key, salt),
            key,
            value: value.into(),
            seq,
            signature,
            salt: salt.map(|s| s.into()),
        }
    }

    /// Build a verified item out of the fields of a `get` response or `put` request.
    pub(crate) fn from_dht_message(
        target: Id,
        key: &[u8; 32],
        v: Box<[u8]>,
        seq: i64,
        signature: &[u8; 64],
        salt: Option<Box<[u8]>>,
    ) -> Result<Self, MutableError> {
        let item = Self {
            target,
            key: *key,
            value: v,
            seq,
            signature: *signature,
            salt,
        };

        item.verify()?;

        Ok(item)
    }

    /// Check that the target is derived from the key and salt,
    /// and that the signature covers `salt`, `seq` and `value`.
    pub fn verify(&self) -> Result<(), MutableError> {
        if MutableItem::target_from_key(&self.key, self.salt()) != self.target {
            return Err(MutableError::TargetMismatch);
        }

        let key =
            VerifyingKey::from_bytes(&self.key).map_err(|_| MutableError::InvalidPublicKey)?;
        let signature = Signature::from_bytes(&self.signature);

        key.verify(
            &encode_signable(self.seq, &self.value, self.salt()),
            &signature,
        )
        .map_err(|_| MutableError::InvalidSignature)
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }
}

/// The bencoded `salt`, `seq` and `v` fields that get signed, without the outer dictionary.
pub fn encode_signable(seq: i64, value: &[u8], salt: Option<&[u8]>) -> Box<[u8]> {
    let mut signable = vec![];

    if let Some(salt) = salt {
        signable.extend(format!("4:salt{}:", salt.len()).into_bytes());
        signable.extend(salt);
    }

    signable.extend(format!("3:seqi{}e1:v{}:", seq, value.len()).into_bytes());
    signable.extend(value);

    signable.into()
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors verifying a [MutableItem].
pub enum MutableError {
    #[error("Invalid mutable item signature")]
    InvalidSignature,

    #[error("Invalid mutable item public key")]
    InvalidPublicKey,

    #[error("Target is not the hash of the public key and salt")]
    TargetMismatch,
}

impl PutMutableRequestArguments {
    /// Create a [PutMutableRequestArguments] from a [MutableItem],
    /// and an optional CAS condition, which is usually the [MutableItem::seq]
    /// of the most recent known [MutableItem]
    pub fn from(item: MutableItem, cas: Option<i64>) -> Self {
        Self {
            target: item.target,
            v: item.value,
            k: item.key,
            seq: item.seq,
            sig: item.signature,
            salt: item.salt,
            cas,
        }
    }
}

impl From<PutMutableRequestArguments> for MutableItem {
    fn from(request: PutMutableRequestArguments) -> Self {
        Self {
            target: request.target,
            value: request.v,
            key: request.k,
            seq: request.seq,
            signature: request.sig,
            salt: request.salt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSigner;

    impl Signer for NullSigner {
        fn public_key(&self) -> [u8; 32] {
            [7; 32]
        }

        fn sign(&self, _message: &[u8]) -> [u8; 64] {
            [0; 64]
        }
    }

    #[test]
    fn signable_without_salt() {
        let signable = encode_signable(4, b"Hello world!", None);

        assert_eq!(&*signable, b"3:seqi4e1:v12:Hello world!");
    }

    #[test]
    fn signable_with_salt() {
        let signable = encode_signable(4, b"Hello world!", Some(b"foobar"));

        assert_eq!(&*signable, b"4:salt6:foobar3:seqi4e1:v12:Hello world!");
    }

    #[test]
    fn signed_item_verifies() {
        let signer = SigningKey::from_bytes(&[7; 32]);

        let item = MutableItem::new(&signer, b"hello", 1, Some(b"salt"));

        assert_eq!(item.verify(), Ok(()));
        assert_eq!(
            item.target(),
            &MutableItem::target_from_key(&signer.public_key(), Some(b"salt"))
        );
    }

    #[test]
    fn tampered_value_fails() {
        let signer = SigningKey::from_bytes(&[7; 32]);
        let item = MutableItem::new(&signer, b"hello", 1, None);

        let tampered =
            MutableItem::new_signed_unchecked(*item.key(), *item.signature(), b"hellO", 1, None);

        assert_eq!(tampered.verify(), Err(MutableError::InvalidSignature));
    }

    #[test]
    fn custom_signer_is_used() {
        let item = MutableItem::new(&NullSigner, b"hello", 1, None);

        assert_eq!(item.key(), &[7; 32]);
        assert_eq!(item.signature(), &[0; 64]);
        assert!(item.verify().is_err());
    }

    #[test]
    fn from_dht_message_checks_target() {
        let signer = SigningKey::from_bytes(&[9; 32]);
        let item = MutableItem::new(&signer, b"hello", 1, None);

        let result = MutableItem::from_dht_message(
            Id::random(),
            item.key(),
            item.value().into(),
            item.seq(),
            item.signature(),
            None,
        );

        assert_eq!(result, Err(MutableError::TargetMismatch));
    }
}
