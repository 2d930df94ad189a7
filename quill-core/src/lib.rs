//! Consensus primitives for quill: hashes, amounts, scripts, transactions,
//! blocks, the consensus wire codec, and the network parameter / fork tables
//! every behavioural branch keys on.

pub mod block;
pub mod codec;
pub mod params;
pub mod script;
pub mod tx;

pub use block::{Block, BlockHeader, ProofType, BLOCK_VERSION_GENESIS, BLOCK_VERSION_PURCHASE, BLOCK_VERSION_QPOS};
pub use codec::{CodecError, Decodable, Encodable, Hash256, Reader};
pub use params::{ChainParams, Fork, Network};
pub use quill_crypto::PubKey;
pub use script::{ScriptPubKey, QposOpTag};
pub use tx::{Amount, OutPoint, Transaction, TxIn, TxOut, COIN, MAX_MONEY};

/// Valid money range for any single value in consensus.
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
