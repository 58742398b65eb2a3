//! Helper functions for immutable items.

use sha1_smol::Sha1;

use super::{Id, ID_SIZE};

/// Maximum size of a stored value (`v` field) in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;

/// Returns true if `target` is the sha1 hash of the bencoded `v`.
pub fn validate_immutable(v: &[u8], target: &Id) -> bool {
    hash_immutable(v) == *target.as_bytes()
}

/// The target of an immutable item is the sha1 hash of its bencoded value.
pub fn hash_immutable(v: &[u8]) -> [u8; ID_SIZE] {
    let mut encoded = Vec::with_capacity(v.len() + 5);
    encoded.extend(format!("{}:", v.len()).bytes());
    encoded.extend_from_slice(v);

    let mut hasher = Sha1::new();
    hasher.update(&encoded);

    hasher.digest().bytes()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_validate_immutable() {
        let v = vec![
            171, 118, 111, 111, 174, 109, 195, 32, 138, 140, 113, 176, 76, 135, 116, 132, 156, 126,
            75, 173,
        ];

        let target = Id::from_bytes([
            2, 23, 113, 43, 67, 11, 185, 26, 26, 30, 204, 238, 204, 1, 13, 84, 52, 40, 86, 231,
        ])
        .unwrap();

        assert!(validate_immutable(&v, &target));
        assert!(!validate_immutable(&v[1..], &target));
    }

    #[test]
    fn test_hash_immutable() {
        let v = b"did:dht:example document";
        let target = Id::from_str("9c31e8e3352541c00d1d7b09bd47d18946fc835c").unwrap();

        assert_eq!(hash_immutable(v), *target.as_bytes());
    }
}
