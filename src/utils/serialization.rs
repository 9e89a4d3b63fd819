// Thin wrappers so every payload goes through the same bincode configuration
use crate::error::{HarnessError, Result};

/// Serialize data using bincode 2.0 with standard configuration
pub fn serialize<T: bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| HarnessError::Serialization(format!("Serialization failed: {e}")))
}

/// Deserialize data using bincode 2.0 with standard configuration
///
/// Returns the value and the number of bytes consumed.
pub fn deserialize<T>(bytes: &[u8]) -> Result<(T, usize)>
where
    T: bincode::Decode<()>,
{
    let config = bincode::config::standard();
    bincode::decode_from_slice(bytes, config)
        .map_err(|e| HarnessError::Serialization(format!("Deserialization failed: {e}")))
}

/// Like [`deserialize`], but refuses to read or allocate more than `LIMIT` bytes.
///
/// Container lengths inside untrusted input are checked against the limit
/// before any allocation happens.
pub fn deserialize_limited<T, const LIMIT: usize>(bytes: &[u8]) -> Result<(T, usize)>
where
    T: bincode::Decode<()>,
{
    let config = bincode::config::standard().with_limit::<LIMIT>();
    bincode::decode_from_slice(bytes, config)
        .map_err(|e| HarnessError::Serialization(format!("Deserialization failed: {e}")))
}
