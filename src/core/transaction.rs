// Coinbase-only transactions: the harness never moves value, it only needs
// a reward-claiming transaction so every block carries a unique commitment.

use crate::error::{HarnessError, Result};
use crate::utils::{base58_decode, serialize, sha256d};
use serde::{Deserialize, Serialize};

/// Fixed payout address for blocks built by the harness
pub const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

pub const ADDRESS_CHECK_SUM_LEN: usize = 4;

// Coinbase inputs spend nothing: all-zero txid and this output index
const COINBASE_VOUT: u32 = u32::MAX;

const TX_VERSION: u32 = 1;

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    prev_txid: [u8; 32],
    vout: u32,
    script_sig: Vec<u8>,
}

impl TXInput {
    pub fn get_prev_txid(&self) -> &[u8; 32] {
        &self.prev_txid
    }

    pub fn get_vout(&self) -> u32 {
        self.vout
    }

    pub fn get_script_sig(&self) -> &[u8] {
        self.script_sig.as_slice()
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    version: u32,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Coinbase paying `reward` to `address`.
    ///
    /// The input script commits to the block height followed by `extra_nonce`,
    /// so coinbases for different heights (or different producers) never
    /// share a txid.
    pub fn new_coinbase(height: u64, address: &str, reward: u64, extra_nonce: &[u8]) -> Result<Transaction> {
        let pub_key_hash = address_to_pub_key_hash(address)?;

        let mut script_sig = height.to_be_bytes().to_vec();
        script_sig.extend_from_slice(extra_nonce);

        Ok(Transaction {
            version: TX_VERSION,
            vin: vec![TXInput {
                prev_txid: [0u8; 32],
                vout: COINBASE_VOUT,
                script_sig,
            }],
            vout: vec![TXOutput {
                value: reward,
                pub_key_hash,
            }],
        })
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prev_txid == [0u8; 32] && self.vin[0].vout == COINBASE_VOUT
    }

    /// Height committed to by a coinbase input, if this is one
    pub fn coinbase_height(&self) -> Option<u64> {
        if !self.is_coinbase() {
            return None;
        }
        let script = self.vin[0].script_sig.as_slice();
        let bytes: [u8; 8] = script.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn txid(&self) -> Result<[u8; 32]> {
        Ok(sha256d(&serialize(self)?))
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_output_value(&self) -> u64 {
        self.vout.iter().map(TXOutput::get_value).sum()
    }
}

/// Decode a base58check address into its public key hash
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() < ADDRESS_CHECK_SUM_LEN + 2 {
        return Err(HarnessError::InvalidBlock(format!(
            "Address too short: {address}"
        )));
    }

    let (body, checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if sha256d(body)[..ADDRESS_CHECK_SUM_LEN] != *checksum {
        return Err(HarnessError::InvalidBlock(format!(
            "Bad address checksum: {address}"
        )));
    }

    // version byte + pub_key_hash
    Ok(body[1..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::INITIAL_BLOCK_REWARD;

    #[test]
    fn test_coinbase_structure() {
        let tx = Transaction::new_coinbase(7, TEST_ADDRESS, INITIAL_BLOCK_REWARD, b"x").unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.coinbase_height(), Some(7));
        assert_eq!(tx.get_output_value(), INITIAL_BLOCK_REWARD);
        assert_eq!(tx.get_vout()[0].get_pub_key_hash().len(), 20);
    }

    #[test]
    fn test_txid_depends_on_height_and_extra_nonce() {
        let a = Transaction::new_coinbase(1, TEST_ADDRESS, 1, b"").unwrap();
        let b = Transaction::new_coinbase(2, TEST_ADDRESS, 1, b"").unwrap();
        let c = Transaction::new_coinbase(1, TEST_ADDRESS, 1, b"other").unwrap();

        assert_eq!(a.txid().unwrap(), a.clone().txid().unwrap());
        assert_ne!(a.txid().unwrap(), b.txid().unwrap());
        assert_ne!(a.txid().unwrap(), c.txid().unwrap());
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(Transaction::new_coinbase(1, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb", 1, b"").is_err());
        assert!(address_to_pub_key_hash("abc").is_err());
    }
}
