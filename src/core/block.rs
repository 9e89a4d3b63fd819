use crate::core::merkle::transactions_root;
use crate::core::Transaction;
use crate::error::{HarnessError, Result};
use crate::utils::{deserialize, serialize, sha256d};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Serialized header size: version, prev hash, merkle root, time, height,
/// difficulty, nonce
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 8 + 8 + 4 + 4;

/// Content hash of a block header, used as the block's identifier
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    bincode::Encode,
    bincode::Decode,
)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Hex in JSON reports instead of a 32-element array
impl Serialize for BlockHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for BlockHash {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map_err(|e| HarnessError::InvalidBlock(format!("Invalid block hash {s}: {e}")))?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            HarnessError::InvalidBlock(format!("Block hash {s} is not 32 bytes"))
        })?;
        Ok(BlockHash(array))
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: BlockHash,
    pub merkle_root: [u8; 32],
    pub time: i64,
    pub height: u64,
    pub difficulty: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Fixed big-endian layout that both hashing and proof-of-work read
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut data = [0u8; HEADER_SIZE];
        let mut offset = 0;
        let mut put = |bytes: &[u8]| {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        };
        put(&self.version.to_be_bytes());
        put(self.prev_hash.as_bytes());
        put(&self.merkle_root);
        put(&self.time.to_be_bytes());
        put(&self.height.to_be_bytes());
        put(&self.difficulty.to_be_bytes());
        put(&self.nonce.to_be_bytes());
        data
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(sha256d(&self.to_bytes()))
    }
}

/// A block as relayed on the wire. The hash is always derived from the
/// header and never stored alongside it.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Result<Block> {
        if transactions.is_empty() {
            return Err(HarnessError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }
        Ok(Block {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn get_prev_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    pub fn get_height(&self) -> u64 {
        self.header.height
    }

    pub fn get_time(&self) -> i64 {
        self.header.time
    }

    pub fn get_nonce(&self) -> u32 {
        self.header.nonce
    }

    pub fn get_difficulty(&self) -> u32 {
        self.header.difficulty
    }

    /// Structural checks a relaying node performs before proof-of-work
    pub fn check_structure(&self) -> Result<()> {
        let coinbase = self.coinbase().ok_or_else(|| {
            HarnessError::InvalidBlock(format!("Block {} has no coinbase", self.hash()))
        })?;
        if coinbase.coinbase_height() != Some(self.header.height) {
            return Err(HarnessError::InvalidBlock(format!(
                "Block {} coinbase does not commit to height {}",
                self.hash(),
                self.header.height
            )));
        }
        if transactions_root(&self.transactions)? != self.header.merkle_root {
            return Err(HarnessError::InvalidBlock(format!(
                "Block {} merkle root mismatch",
                self.hash()
            )));
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        let (block, consumed) = deserialize::<Block>(bytes)?;
        if consumed != bytes.len() {
            return Err(HarnessError::Serialization(format!(
                "{} trailing bytes after block",
                bytes.len() - consumed
            )));
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{block_subsidy, BlockBuilder, TEST_ADDRESS};

    fn sample_block() -> Block {
        BlockBuilder::new(1)
            .build(BlockHash::ZERO, 1, 1_700_000_000)
            .unwrap()
    }

    #[test]
    fn test_hash_is_stable_without_mutation() {
        let block = sample_block();
        let first = block.hash();
        for _ in 0..5 {
            assert_eq!(block.hash(), first);
        }
        let bytes = block.serialize().unwrap();
        assert_eq!(Block::deserialize(&bytes).unwrap().hash(), first);
    }

    #[test]
    fn test_hash_follows_header_changes() {
        let block = sample_block();
        let mut header = block.header().clone();
        header.time += 1;
        assert_ne!(header.hash(), block.hash());
    }

    #[test]
    fn test_header_layout_size() {
        let block = sample_block();
        assert_eq!(block.header().to_bytes().len(), HEADER_SIZE);
    }

    #[test]
    fn test_block_hash_hex_round_trip() {
        let hash = sample_block().hash();
        let parsed: BlockHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert!("abcd".parse::<BlockHash>().is_err());
    }

    #[test]
    fn test_structure_check_catches_wrong_height() {
        let block = sample_block();
        assert!(block.check_structure().is_ok());

        let coinbase =
            Transaction::new_coinbase(2, TEST_ADDRESS, block_subsidy(2), b"").unwrap();
        let tampered = Block::new(block.header().clone(), vec![coinbase]).unwrap();
        assert!(tampered.check_structure().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_block().serialize().unwrap();
        bytes.push(0);
        assert!(Block::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_empty_block_rejected() {
        let header = sample_block().header().clone();
        assert!(Block::new(header, vec![]).is_err());
    }
}
