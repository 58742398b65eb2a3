#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod core;
mod dht;
mod engine;

#[cfg(feature = "async")]
pub mod async_dht;

pub use crate::common::{
    encode_signable, hash_immutable, messages, Id, MutableItem, Node, RoutingTable, Signer,
    MAX_SALT_SIZE, MAX_VALUE_SIZE,
};
pub use crate::core::{StoreError, StoredRecord, MAX_VALUES};
pub use crate::engine::{
    Config, Info, LookupState, DEFAULT_ALPHA, DEFAULT_BOOTSTRAP_NODES, DEFAULT_MAX_RETRIES,
    DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT, TOKEN_ROTATE_INTERVAL,
};
pub use dht::{Dht, DhtBuilder, Testnet};

pub use ed25519_dalek::SigningKey;

pub mod errors {
    //! Exported errors

    pub use super::common::{DecodeIdError, MutableError};
    pub use super::dht::{DhtGetError, DhtPutError, DhtWasShutdown};
    pub use super::engine::{PutError, TransactionError};
}
