use crate::core::{BlockHash, BlockHeader};
use crate::error::{HarnessError, Result};
use log::debug;
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;

/// Every nonce a header can carry
pub const NONCE_SPACE: u64 = u32::MAX as u64 + 1;

/// Target check for a fixed number of required leading zero bits
pub struct ProofOfWork {
    target: BigInt,
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> ProofOfWork {
        let mut target = BigInt::from(1);
        target.shl_assign(256 - difficulty.min(256));
        ProofOfWork { target, difficulty }
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn meets_target(&self, hash: &BlockHash) -> bool {
        let hash_int = BigInt::from_bytes_be(Sign::Plus, hash.as_bytes());
        hash_int < self.target
    }

    /// Validate proof-of-work for a header against its own difficulty field
    pub fn validate(header: &BlockHeader) -> bool {
        ProofOfWork::new(header.difficulty).meets_target(&header.hash())
    }

    /// Search nonces from `header.nonce` upward, trying at most
    /// `max_attempts` of them. The header is left with the winning nonce.
    pub fn solve(&self, header: &mut BlockHeader, max_attempts: u64) -> Result<BlockHash> {
        let start = header.nonce;
        let attempts = max_attempts.min(NONCE_SPACE);

        for i in 0..attempts {
            header.nonce = start.wrapping_add(i as u32);
            let hash = header.hash();
            if self.meets_target(&hash) {
                debug!(
                    "Solved block at height {} after {} attempts: {hash}",
                    header.height,
                    i + 1
                );
                return Ok(hash);
            }
        }

        header.nonce = start;
        Err(HarnessError::ExhaustedNonceSpace {
            height: header.height,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BlockBuilder;

    fn unsolved_header(difficulty: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: BlockHash::ZERO,
            merkle_root: [7u8; 32],
            time: 1_700_000_000,
            height: 1,
            difficulty,
            nonce: 0,
        }
    }

    #[test]
    fn test_higher_difficulty_has_smaller_target() {
        let easy = ProofOfWork::new(1);
        let hard = ProofOfWork::new(8);
        assert!(hard.target < easy.target);
    }

    #[test]
    fn test_solve_produces_valid_header() {
        let mut header = unsolved_header(4);
        let pow = ProofOfWork::new(4);
        let hash = pow.solve(&mut header, NONCE_SPACE).unwrap();

        assert_eq!(hash, header.hash());
        assert!(ProofOfWork::validate(&header));
    }

    #[test]
    fn test_bounded_search_reports_exhaustion() {
        let mut header = unsolved_header(255);
        let result = ProofOfWork::new(255).solve(&mut header, 16);

        assert_eq!(
            result,
            Err(HarnessError::ExhaustedNonceSpace {
                height: 1,
                attempts: 16
            })
        );
        assert_eq!(header.nonce, 0);
    }

    #[test]
    fn test_built_block_validates() {
        let block = BlockBuilder::new(2)
            .build(BlockHash::ZERO, 1, 1_700_000_000)
            .unwrap();
        assert!(ProofOfWork::validate(block.header()));
    }
}
