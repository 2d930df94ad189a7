//! The qPoS staker registry: per-staker state, balances, aliases, NFT
//! ownership, the shuffled per-round producer queue, and the block-by-block
//! state machine that advances it all deterministically.

pub mod alias;
pub mod bits;
pub mod error;
pub mod meta;
pub mod nft;
pub mod ops;
pub mod power;
pub mod queue;
pub mod registry;
pub mod staker;
pub mod summary;

pub use error::RegistryError;
pub use ops::{extract_ops, parse_qpos_output, KeyRole, QposOp};
pub use queue::QpQueue;
pub use registry::{BlockInfo, NullSnapshotSink, QpRegistry, SnapshotSink, SnapshotType};
pub use staker::QpStaker;

/// One trillion; picopower is a fraction of this.
pub const TRIL: u64 = 1_000_000_000_000;

/// Registry-level recent-block window, in slots.
pub const QP_REGISTRY_RECENT_BLOCKS: usize = 2048;
/// Per-staker recent-block window, in slots.
pub const QP_STAKER_RECENT_BLOCKS: usize = 4096;
/// A staker is exempt from disqualification until it has seen this many
/// blocks.
pub const QP_NOOB_BLOCKS: u32 = (QP_STAKER_RECENT_BLOCKS * 2) as u32;
/// Seconds per producer slot; identical on every network.
pub const QP_TARGET_SPACING: u32 = 5;
/// NFT ids are bounded; digit aliases above this are rejected outright.
pub const QP_MAX_NFT_ID: u32 = 100_000;
