//! Utility functions and helpers
//!
//! Hashing, base58 and the shared bincode configuration.

pub mod crypto;
pub mod serialization;

pub use crypto::{base58_decode, base58_encode, current_timestamp, sha256_digest, sha256d};

pub use serialization::{deserialize, deserialize_limited, serialize};
