//! Kademlia node Id or a lookup target
use rand::Rng;
use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();

        let bytes: [u8; ID_SIZE] = bytes.try_into().map_err(|_| InvalidIdSize(bytes.len()))?;

        Ok(Id(bytes))
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Full XOR metric, comparable lexicographically.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0).enumerate() {
            result[i] = a ^ b;
        }

        result.into()
    }

    /// Returns a random Id at exactly `distance` from this Id.
    ///
    /// Used to refresh a k-bucket by looking up an arbitrary Id inside its range.
    pub fn random_at_distance(&self, distance: u8) -> Id {
        if distance == 0 {
            return *self;
        }

        let distance = distance.min(MAX_DISTANCE);
        let mut noise: [u8; ID_SIZE] = rand::thread_rng().gen();

        // Bit index (from the most significant bit) of the first differing bit.
        let first_diff = (MAX_DISTANCE - distance) as usize;
        let byte = first_diff / 8;
        let bit = first_diff % 8;

        for b in noise.iter_mut().take(byte) {
            *b = 0;
        }

        let high = 0x80_u8 >> bit;
        noise[byte] = (noise[byte] & (high - 1)) | high;

        self.xor(&Id(noise))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(id: Id) -> [u8; ID_SIZE] {
        id.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeIdError::InvalidHexCharacter);
        }

        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(InvalidIdSize(s.len() / 2)));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or(DecodeIdError::InvalidHexCharacter)?;

            *byte = u8::from_str_radix(pair, 16).map_err(|_| DecodeIdError::InvalidHexCharacter)?;
        }

        Ok(Id(bytes))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Id size, expected {ID_SIZE} bytes, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors parsing an [Id] from a hex string.
pub enum DecodeIdError {
    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Invalid hex character")]
    InvalidHexCharacter,
}
