use crate::core::Transaction;
use crate::error::{HarnessError, Result};
use crate::utils::sha256d;

/// Bitcoin-style merkle root: pair up hashes level by level, duplicating the
/// last one when a level has an odd count.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Result<[u8; 32]> {
    if leaves.is_empty() {
        return Err(HarnessError::InvalidBlock(
            "Cannot compute merkle root of an empty list".to_string(),
        ));
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next.push(sha256d(&data));
        }
        level = next;
    }
    Ok(level[0])
}

/// Merkle root over the txids of `transactions`
pub fn transactions_root(transactions: &[Transaction]) -> Result<[u8; 32]> {
    let txids = transactions
        .iter()
        .map(Transaction::txid)
        .collect::<Result<Vec<_>>>()?;
    merkle_root(&txids)
}
