//! Stake modifier chain for the PoW/PoS era. Each block folds its hash into
//! a rolling 64-bit modifier; a checksum chain over modifiers is validated
//! against hardened checkpoints during bootstrap. qPoS blocks carry the
//! modifier forward unchanged.

use quill_core::Hash256;
use quill_crypto::sha256d;

/// Next modifier: previous modifier folded with the new block hash.
pub fn compute_stake_modifier(prev_modifier: u64, block_hash: &Hash256) -> u64 {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&prev_modifier.to_le_bytes());
    buf.extend_from_slice(&block_hash.0);
    let digest = sha256d(&buf);
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

/// Rolling checksum over the modifier chain, chained through the parent's
/// checksum so one historic divergence poisons everything after it.
pub fn modifier_checksum(
    prev_checksum: u32,
    flags: u32,
    modifier: u64,
    hash_proof_of_stake: &Hash256,
) -> u32 {
    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(&prev_checksum.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&modifier.to_le_bytes());
    buf.extend_from_slice(&hash_proof_of_stake.0);
    let digest = sha256d(&buf);
    u32::from_le_bytes(digest[0..4].try_into().unwrap())
}
