//! The in-memory block tree. Nodes live in an arena; `prev`/`next` are
//! stable indices instead of pointers, with `next` set only along the main
//! chain. A height lookup covers main-chain nodes only and is rebuilt for
//! the affected range on reorganization.

use std::collections::HashMap;

use num_bigint::BigUint;

use quill_core::{block::block_work, Amount, Block, ChainParams, Hash256, OutPoint, ProofType};
use quill_registry::{BlockInfo, QposOp};
use quill_storage::{BlockFilePos, DiskBlockIndexRecord};

pub type NodeId = usize;

pub const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const FLAG_STAKE_ENTROPY: u32 = 1 << 1;
pub const FLAG_STAKE_MODIFIER: u32 = 1 << 2;
pub const FLAG_QPOS: u32 = 1 << 3;

/// Trust granted to a block that carries no work: schedule blocks count a
/// fixed large weight so a longer qPoS chain always outranks a shorter one.
const QPOS_BLOCK_TRUST: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub pos: BlockFilePos,
    pub height: i32,
    pub mint: Amount,
    pub money_supply: Amount,
    pub flags: u32,
    pub stake_modifier: u64,
    /// In-memory only; recomputed on load.
    pub modifier_checksum: u32,
    pub chain_trust: BigUint,
    // proof-of-stake specifics
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
    pub hash_proof_of_stake: Hash256,
    // block stats
    pub tx_volume: u32,
    pub value_volume: Amount,
    pub pico_power: u64,
    pub block_size: u32,
    // header
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub staker_id: u32,
    /// qPoS operations staged from the block's transactions.
    pub qpos_ops: Vec<QposOp>,
}

impl BlockIndexEntry {
    pub fn from_block(
        block: &Block,
        hash: Hash256,
        pos: BlockFilePos,
        height: i32,
        qpos_ops: Vec<QposOp>,
        params: &ChainParams,
    ) -> Self {
        let mut flags = 0;
        let (prevout_stake, stake_time) = match block.proof_type() {
            ProofType::Pos => {
                flags |= FLAG_PROOF_OF_STAKE;
                block.proof_of_stake().unwrap_or((OutPoint::null(), 0))
            }
            ProofType::QPos => {
                flags |= FLAG_QPOS;
                (OutPoint::null(), 0)
            }
            ProofType::Pow => (OutPoint::null(), 0),
        };
        BlockIndexEntry {
            hash,
            prev: None,
            next: None,
            pos,
            height,
            mint: 0,
            money_supply: 0,
            flags,
            stake_modifier: 0,
            modifier_checksum: 0,
            chain_trust: BigUint::default(),
            prevout_stake,
            stake_time,
            hash_proof_of_stake: Hash256::ZERO,
            tx_volume: block.tx_volume(),
            value_volume: block.total_output_value(),
            pico_power: 0,
            block_size: 0,
            version: block.version,
            merkle_root: block.merkle_root,
            time: block.time,
            bits: block.bits,
            nonce: block.nonce,
            staker_id: block.staker_id,
            qpos_ops,
        }
        .with_entropy(block, params)
    }

    fn with_entropy(mut self, block: &Block, params: &ChainParams) -> Self {
        if block.stake_entropy_bit(params) == 1 {
            self.flags |= FLAG_STAKE_ENTROPY;
        }
        self
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & FLAG_PROOF_OF_STAKE != 0
    }

    pub fn is_qpos(&self) -> bool {
        self.flags & FLAG_QPOS != 0
    }

    pub fn is_proof_of_work(&self) -> bool {
        !(self.is_proof_of_stake() || self.is_qpos())
    }

    pub fn stake_entropy_bit(&self) -> u32 {
        (self.flags & FLAG_STAKE_ENTROPY) >> 1
    }

    /// Work this single block adds to its chain.
    pub fn block_trust(&self) -> BigUint {
        if self.is_qpos() {
            BigUint::from(QPOS_BLOCK_TRUST)
        } else {
            // both PoW and PoS targets encode difficulty in `bits`
            block_work(self.bits).max(BigUint::from(1u8))
        }
    }

    pub fn block_info(&self) -> BlockInfo {
        BlockInfo {
            height: self.height,
            hash: self.hash,
            time: self.time,
            money_supply: self.money_supply,
            staker_id: self.staker_id,
        }
    }

    pub fn to_disk_record(&self, index: &BlockIndex) -> DiskBlockIndexRecord {
        DiskBlockIndexRecord {
            block_hash: self.hash,
            hash_prev: self
                .prev
                .map(|p| index.entry(p).hash)
                .unwrap_or(Hash256::ZERO),
            hash_next: self
                .next
                .map(|n| index.entry(n).hash)
                .unwrap_or(Hash256::ZERO),
            pos: self.pos,
            height: self.height,
            mint: self.mint,
            money_supply: self.money_supply,
            flags: self.flags,
            stake_modifier: self.stake_modifier,
            prevout_stake: self.prevout_stake,
            stake_time: self.stake_time,
            hash_proof_of_stake: self.hash_proof_of_stake,
            tx_volume: self.tx_volume,
            value_volume: self.value_volume,
            pico_power: self.pico_power,
            block_size: self.block_size,
            version: self.version,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
            staker_id: self.staker_id,
            qpos_ops: self.qpos_ops.clone(),
        }
    }

    pub fn from_disk_record(record: DiskBlockIndexRecord) -> Self {
        BlockIndexEntry {
            hash: record.block_hash,
            prev: None,
            next: None,
            pos: record.pos,
            height: record.height,
            mint: record.mint,
            money_supply: record.money_supply,
            flags: record.flags,
            stake_modifier: record.stake_modifier,
            modifier_checksum: 0,
            chain_trust: BigUint::default(),
            prevout_stake: record.prevout_stake,
            stake_time: record.stake_time,
            hash_proof_of_stake: record.hash_proof_of_stake,
            tx_volume: record.tx_volume,
            value_volume: record.value_volume,
            pico_power: record.pico_power,
            block_size: record.block_size,
            version: record.version,
            merkle_root: record.merkle_root,
            time: record.time,
            bits: record.bits,
            nonce: record.nonce,
            staker_id: record.staker_id,
            qpos_ops: record.qpos_ops,
        }
    }
}

/// The arena plus its lookups.
#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, NodeId>,
    /// Main-chain nodes only.
    by_height: HashMap<i32, NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, entry: BlockIndexEntry) -> NodeId {
        let id = self.nodes.len();
        self.by_hash.insert(entry.hash, id);
        self.nodes.push(entry);
        id
    }

    pub fn entry(&self, id: NodeId) -> &BlockIndexEntry {
        &self.nodes[id]
    }

    pub fn entry_mut(&mut self, id: NodeId) -> &mut BlockIndexEntry {
        &mut self.nodes[id]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Main-chain node at a height.
    pub fn at_height(&self, height: i32) -> Option<NodeId> {
        self.by_height.get(&height).copied()
    }

    pub fn set_main_chain_at(&mut self, height: i32, id: Option<NodeId>) {
        match id {
            Some(id) => {
                self.by_height.insert(height, id);
            }
            None => {
                self.by_height.remove(&height);
            }
        }
    }

    /// Is `id` on the main chain (has a forward link, or is the given tip)?
    pub fn is_in_main_chain(&self, id: NodeId, best: Option<NodeId>) -> bool {
        self.entry(id).next.is_some() || best == Some(id)
    }

    /// Walk back from `a` and `b` to their common ancestor.
    pub fn common_ancestor(&self, mut a: NodeId, mut b: NodeId) -> Option<NodeId> {
        while self.entry(a).height > self.entry(b).height {
            a = self.entry(a).prev?;
        }
        while self.entry(b).height > self.entry(a).height {
            b = self.entry(b).prev?;
        }
        while a != b {
            a = self.entry(a).prev?;
            b = self.entry(b).prev?;
        }
        Some(a)
    }

    /// Path from (exclusive) `ancestor` down to `descendant`, oldest first.
    pub fn path_down(&self, ancestor: NodeId, descendant: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut at = descendant;
        while at != ancestor {
            path.push(at);
            match self.entry(at).prev {
                Some(prev) => at = prev,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Median of the last 11 block times ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(11);
        let mut at = Some(id);
        for _ in 0..11 {
            match at {
                Some(node) => {
                    times.push(self.entry(node).time as i64);
                    at = self.entry(node).prev;
                }
                None => break,
            }
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Earliest acceptable timestamp for a successor of `id`.
    pub fn past_time_limit(&self, id: NodeId, params: &ChainParams) -> i64 {
        if params.fork_at(self.entry(id).height) >= quill_core::Fork::BlockTimeRule {
            self.entry(id).time as i64
        } else {
            self.median_time_past(id)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexEntry)> {
        self.nodes.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash_byte: u8, height: i32, prev: Option<NodeId>) -> BlockIndexEntry {
        BlockIndexEntry {
            hash: Hash256([hash_byte; 32]),
            prev,
            next: None,
            pos: BlockFilePos::null(),
            height,
            mint: 0,
            money_supply: 0,
            flags: 0,
            stake_modifier: 0,
            modifier_checksum: 0,
            chain_trust: BigUint::default(),
            prevout_stake: OutPoint::null(),
            stake_time: 0,
            hash_proof_of_stake: Hash256::ZERO,
            tx_volume: 0,
            value_volume: 0,
            pico_power: 0,
            block_size: 0,
            version: 1,
            merkle_root: Hash256::ZERO,
            time: 100 + height as u32,
            bits: 0x1e0f_ffff,
            nonce: 0,
            staker_id: 0,
            qpos_ops: Vec::new(),
        }
    }

    #[test]
    fn ancestor_and_path() {
        // 0 - 1 - 2 - 3
        //       \ 4 - 5
        let mut index = BlockIndex::new();
        let n0 = index.insert(entry(0, 0, None));
        let n1 = index.insert(entry(1, 1, Some(n0)));
        let n2 = index.insert(entry(2, 2, Some(n1)));
        let n3 = index.insert(entry(3, 3, Some(n2)));
        let n4 = index.insert(entry(4, 2, Some(n1)));
        let n5 = index.insert(entry(5, 3, Some(n4)));

        assert_eq!(index.common_ancestor(n3, n5), Some(n1));
        assert_eq!(index.common_ancestor(n3, n3), Some(n3));
        assert_eq!(index.path_down(n1, n5), vec![n4, n5]);
        assert_eq!(index.path_down(n0, n3), vec![n1, n2, n3]);
    }

    #[test]
    fn median_time() {
        let mut index = BlockIndex::new();
        let mut prev = None;
        let mut last = 0;
        for h in 0..5 {
            last = index.insert(entry(h as u8, h, prev));
            prev = Some(last);
        }
        // times are 100..104; median of 5 values is 102
        assert_eq!(index.median_time_past(last), 102);
    }
}
