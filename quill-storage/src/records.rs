//! Durable record shapes: the transaction index entry and the on-disk block
//! index node (pointers marshalled as hashes).

use quill_core::{Amount, CodecError, Decodable, Encodable, Hash256, OutPoint, Reader};
use quill_registry::QposOp;

use crate::blockfile::BlockFilePos;

/// Position of one transaction: the containing block's disk position plus
/// the transaction's offset in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDiskPos {
    pub block_pos: BlockFilePos,
    pub n_tx: u32,
}

impl TxDiskPos {
    pub fn new(block_pos: BlockFilePos, n_tx: u32) -> Self {
        TxDiskPos { block_pos, n_tx }
    }

    pub fn null() -> Self {
        TxDiskPos {
            block_pos: BlockFilePos::null(),
            n_tx: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.block_pos.is_null()
    }
}

impl Encodable for TxDiskPos {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_pos.encode(out);
        self.n_tx.encode(out);
    }
}

impl Decodable for TxDiskPos {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxDiskPos {
            block_pos: BlockFilePos::decode(r)?,
            n_tx: u32::decode(r)?,
        })
    }
}

/// Where a transaction lives on disk and where each of its outputs was
/// spent. A null position in `spent[i]` means output `i` is unspent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIndexEntry {
    pub pos: TxDiskPos,
    /// Height of the containing block; lets maturity checks avoid a disk
    /// walk.
    pub height: i32,
    /// Time of the containing block; bounds coinstake interest.
    pub time: u32,
    pub spent: Vec<TxDiskPos>,
}

impl TxIndexEntry {
    pub fn new(pos: TxDiskPos, height: i32, time: u32, n_outputs: usize) -> Self {
        TxIndexEntry {
            pos,
            height,
            time,
            spent: vec![TxDiskPos::null(); n_outputs],
        }
    }

    pub fn output_is_spent(&self, n: u32) -> bool {
        self.spent
            .get(n as usize)
            .map(|p| !p.is_null())
            .unwrap_or(false)
    }
}

impl Encodable for TxIndexEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        self.pos.encode(out);
        self.height.encode(out);
        self.time.encode(out);
        self.spent.encode(out);
    }
}

impl Decodable for TxIndexEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxIndexEntry {
            pos: TxDiskPos::decode(r)?,
            height: i32::decode(r)?,
            time: u32::decode(r)?,
            spent: Vec::<TxDiskPos>::decode(r)?,
        })
    }
}

/// A block index node as persisted: `prev`/`next` pointers become hashes,
/// and the staged qPoS operations ride along so replay never re-parses
/// scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBlockIndexRecord {
    pub block_hash: Hash256,
    pub hash_prev: Hash256,
    /// Zero unless this node is on the main chain.
    pub hash_next: Hash256,
    pub pos: BlockFilePos,
    pub height: i32,
    pub mint: Amount,
    pub money_supply: Amount,
    pub flags: u32,
    pub stake_modifier: u64,
    /// PoS-only fields; null/zero otherwise.
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
    pub hash_proof_of_stake: Hash256,
    // block stats
    pub tx_volume: u32,
    pub value_volume: Amount,
    pub pico_power: u64,
    pub block_size: u32,
    // header fields
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub staker_id: u32,
    pub qpos_ops: Vec<QposOp>,
}

impl Encodable for DiskBlockIndexRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_hash.encode(out);
        self.hash_prev.encode(out);
        self.hash_next.encode(out);
        self.pos.encode(out);
        self.height.encode(out);
        self.mint.encode(out);
        self.money_supply.encode(out);
        self.flags.encode(out);
        self.stake_modifier.encode(out);
        self.prevout_stake.encode(out);
        self.stake_time.encode(out);
        self.hash_proof_of_stake.encode(out);
        self.tx_volume.encode(out);
        self.value_volume.encode(out);
        self.pico_power.encode(out);
        self.block_size.encode(out);
        self.version.encode(out);
        self.merkle_root.encode(out);
        self.time.encode(out);
        self.bits.encode(out);
        self.nonce.encode(out);
        self.staker_id.encode(out);
        self.qpos_ops.encode(out);
    }
}

impl Decodable for DiskBlockIndexRecord {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(DiskBlockIndexRecord {
            block_hash: Hash256::decode(r)?,
            hash_prev: Hash256::decode(r)?,
            hash_next: Hash256::decode(r)?,
            pos: BlockFilePos::decode(r)?,
            height: i32::decode(r)?,
            mint: Amount::decode(r)?,
            money_supply: Amount::decode(r)?,
            flags: u32::decode(r)?,
            stake_modifier: u64::decode(r)?,
            prevout_stake: OutPoint::decode(r)?,
            stake_time: u32::decode(r)?,
            hash_proof_of_stake: Hash256::decode(r)?,
            tx_volume: u32::decode(r)?,
            value_volume: Amount::decode(r)?,
            pico_power: u64::decode(r)?,
            block_size: u32::decode(r)?,
            version: i32::decode(r)?,
            merkle_root: Hash256::decode(r)?,
            time: u32::decode(r)?,
            bits: u32::decode(r)?,
            nonce: u32::decode(r)?,
            staker_id: u32::decode(r)?,
            qpos_ops: Vec::<QposOp>::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_index_spent_tracking() {
        let block_pos = BlockFilePos {
            file: 0,
            offset: 100,
            size: 50,
        };
        let mut entry = TxIndexEntry::new(TxDiskPos::new(block_pos, 1), 7, 500, 3);
        assert!(!entry.output_is_spent(0));
        entry.spent[1] = TxDiskPos::new(
            BlockFilePos {
                file: 0,
                offset: 400,
                size: 90,
            },
            0,
        );
        assert!(entry.output_is_spent(1));
        assert!(!entry.output_is_spent(9));
        let bytes = entry.to_bytes();
        assert_eq!(TxIndexEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn disk_index_roundtrip() {
        let record = DiskBlockIndexRecord {
            block_hash: Hash256([1; 32]),
            hash_prev: Hash256([2; 32]),
            hash_next: Hash256::ZERO,
            pos: BlockFilePos {
                file: 1,
                offset: 9,
                size: 400,
            },
            height: 42,
            mint: 5_000_000,
            money_supply: 123_456_789,
            flags: 0b1001,
            stake_modifier: 0xdead_beef,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
            hash_proof_of_stake: Hash256::ZERO,
            tx_volume: 3,
            value_volume: 77,
            pico_power: 990_000_000_000,
            block_size: 1234,
            version: 3,
            merkle_root: Hash256([9; 32]),
            time: 1_700_000_000,
            bits: 0x1e0f_ffff,
            nonce: 0,
            staker_id: 5,
            qpos_ops: vec![QposOp::SetState { id: 5, enable: false }],
        };
        let bytes = record.to_bytes();
        assert_eq!(DiskBlockIndexRecord::from_bytes(&bytes).unwrap(), record);
    }
}
