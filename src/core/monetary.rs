//! Block subsidy schedule
//!
//! Follows the satoshi-based units of the node, with the short regtest halving
//! interval so long test chains still exercise a halving.

/// Number of satoshis in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Initial block reward in satoshis (50 coins)
pub const INITIAL_BLOCK_REWARD: u64 = 50 * SATOSHIS_PER_COIN;

/// Blocks between subsidy halvings on regtest
pub const REGTEST_HALVING_INTERVAL: u64 = 150;

/// Coinbase reward for a block at `height`
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / REGTEST_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_halves() {
        assert_eq!(block_subsidy(0), INITIAL_BLOCK_REWARD);
        assert_eq!(block_subsidy(149), INITIAL_BLOCK_REWARD);
        assert_eq!(block_subsidy(150), INITIAL_BLOCK_REWARD / 2);
        assert_eq!(block_subsidy(300), INITIAL_BLOCK_REWARD / 4);
    }

    #[test]
    fn test_subsidy_eventually_zero() {
        assert_eq!(block_subsidy(REGTEST_HALVING_INTERVAL * 64), 0);
    }
}
