use ring::digest::{Context, SHA256};

use crate::error::{HarnessError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds, the unit block headers carry
pub fn current_timestamp() -> Result<i64> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HarnessError::Io(format!("System time error: {e}")))?
        .as_secs();

    i64::try_from(secs).map_err(|_| HarnessError::Io("Timestamp overflow".to_string()))
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

/// SHA-256 applied twice, used for block ids, txids and frame checksums
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = sha256_digest(data);
    let second = sha256_digest(first.as_slice());
    let mut out = [0u8; 32];
    out.copy_from_slice(second.as_slice());
    out
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| HarnessError::InvalidBlock(format!("Invalid base58 encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let digest = sha256_digest(b"abc");
        assert_eq!(
            data_encoding::HEXLOWER.encode(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256d_is_double_hash() {
        let once = sha256_digest(b"relay");
        let twice = sha256_digest(&once);
        assert_eq!(sha256d(b"relay").to_vec(), twice);
    }

    #[test]
    fn test_base58_round_trip() {
        let encoded = base58_encode(&[0, 1, 2, 255]);
        assert_eq!(base58_decode(&encoded).unwrap(), vec![0, 1, 2, 255]);
        assert!(base58_decode("0OIl").is_err());
    }
}
