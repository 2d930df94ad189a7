//! Network-scoped constants and the fork-height table. Every behavioural
//! branch in consensus keys on `ChainParams::fork_at`, never on a build flag.

use std::collections::BTreeMap;

use crate::block::{Block, BLOCK_VERSION_GENESIS};
use crate::codec::Hash256;
use crate::script::ScriptPubKey;
use crate::tx::{Amount, OutPoint, Transaction, TxIn, TxOut, COIN, MAX_MONEY, TX_VERSION_FEELESS, TX_VERSION_GENESIS, TX_VERSION_IMMALLEABLE, TX_VERSION_NOTXTIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
}

/// Consensus fork ordinals, ascending. `fork_at(h) >= Fork::QPos` is the
/// idiom for "qPoS rules are live at height h".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fork {
    Launch,
    /// Block past-time limit switches from median-time to prev-block-time.
    BlockTimeRule,
    /// Transactions drop their embedded timestamp.
    NoTxTime,
    /// Staker purchases become valid; txids blank scriptSigs.
    Purchase,
    /// Fixed-schedule qPoS block production replaces PoW/PoS.
    QPos,
    /// Feeless transactions via proof-of-work stamps.
    Feeless,
    /// Tightened miss accounting for staker disqualification.
    MissFix,
}

/// Frozen per-network parameter set.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    /// Block-file framing magic.
    pub magic: [u8; 4],
    /// `(activation_height, fork)` ascending by height.
    pub forks: Vec<(i32, Fork)>,

    pub target_spacing: u32,
    pub blocks_per_snapshot: i32,
    pub recent_snapshots: i32,
    pub sparse_snapshot_interval: i32,
    pub qp_rounds: u32,
    pub min_pico_power: u64,
    pub dock_inactive_fraction: i64,
    pub min_secs_per_claim: u32,
    pub staker_max_misses: u32,
    /// Terminated stakers are erased from the map on networks where this is
    /// set; otherwise they are retained but excluded from queues.
    pub erase_terminated: bool,

    pub qpos_reward: Amount,
    pub base_pow_reward: Amount,
    pub pow_halving_interval: i32,
    pub pos_annual_permille: i64,
    pub pow_cutoff_height: i32,
    pub coinbase_maturity: i32,
    pub future_drift_secs: u32,
    pub stake_min_age: u32,

    pub initial_supply: Amount,
    pub genesis_time: u32,
    pub pow_limit_bits: u32,

    /// Height whose block hash mixes in the hash-of-NFT-hashes constant.
    pub nft_hash_height: i32,
    pub nft_hash: Hash256,

    /// Hex of the compressed secp256k1 sync-checkpoint master public key.
    pub checkpoint_master_key: String,
    pub hardened_checkpoints: BTreeMap<i32, Hash256>,
    /// Stake-modifier checksum checkpoints validated during bootstrap.
    pub modifier_checkpoints: BTreeMap<i32, u32>,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        ChainParams {
            network: Network::Mainnet,
            magic: [0x71, 0x6c, 0x6c, 0x6d],
            forks: vec![
                (0, Fork::Launch),
                (130_000, Fork::BlockTimeRule),
                (1_190_000, Fork::NoTxTime),
                (2_050_000, Fork::Purchase),
                (2_114_000, Fork::QPos),
                (3_081_857, Fork::Feeless),
                (4_574_000, Fork::MissFix),
            ],
            target_spacing: 5,
            blocks_per_snapshot: 24,
            recent_snapshots: 72,
            sparse_snapshot_interval: 7_200,
            qp_rounds: 16,
            min_pico_power: 510_000_000_000,
            dock_inactive_fraction: 310_000_000_000,
            min_secs_per_claim: 86_400,
            staker_max_misses: 4_320,
            erase_terminated: true,
            qpos_reward: 5 * COIN,
            base_pow_reward: 16 * COIN,
            pow_halving_interval: 1_000_000,
            pos_annual_permille: 200,
            pow_cutoff_height: 5_460,
            coinbase_maturity: 100,
            future_drift_secs: 15,
            stake_min_age: 60 * 60 * 24,
            initial_supply: 24_600_000 * COIN,
            genesis_time: 1_403_668_979,
            pow_limit_bits: 0x1e0f_ffff,
            nft_hash_height: 4_574_850,
            nft_hash: Hash256([0x51; 32]),
            checkpoint_master_key:
                "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798".to_string(),
            hardened_checkpoints: BTreeMap::new(),
            modifier_checkpoints: BTreeMap::new(),
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            network: Network::Testnet,
            magic: [0x71, 0x6c, 0x6c, 0x74],
            forks: vec![
                (0, Fork::Launch),
                (120, Fork::BlockTimeRule),
                (240, Fork::NoTxTime),
                (360, Fork::Purchase),
                (480, Fork::QPos),
                (600, Fork::Feeless),
                (720, Fork::MissFix),
            ],
            target_spacing: 5,
            blocks_per_snapshot: 24,
            recent_snapshots: 72,
            sparse_snapshot_interval: 7_200,
            qp_rounds: 1,
            min_pico_power: 510_000_000_000,
            dock_inactive_fraction: 310_000_000_000,
            min_secs_per_claim: 86_400,
            staker_max_misses: 17_280,
            erase_terminated: false,
            qpos_reward: 5 * COIN,
            base_pow_reward: 16 * COIN,
            pow_halving_interval: 1_000_000,
            pos_annual_permille: 200,
            pow_cutoff_height: 120,
            coinbase_maturity: 10,
            future_drift_secs: 15,
            stake_min_age: 60,
            initial_supply: 24_600_000 * COIN,
            genesis_time: 1_411_700_000,
            pow_limit_bits: 0x1f00_ffff,
            nft_hash_height: 730,
            nft_hash: Hash256([0x52; 32]),
            checkpoint_master_key:
                "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798".to_string(),
            hardened_checkpoints: BTreeMap::new(),
            modifier_checkpoints: BTreeMap::new(),
        }
    }

    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    /// Active fork ordinal at a height.
    pub fn fork_at(&self, height: i32) -> Fork {
        let mut fork = Fork::Launch;
        for &(h, f) in &self.forks {
            if height >= h {
                fork = f;
            } else {
                break;
            }
        }
        fork
    }

    /// First height at which `fork` is active.
    pub fn fork_height(&self, fork: Fork) -> i32 {
        self.forks
            .iter()
            .find(|&&(_, f)| f == fork)
            .map(|&(h, _)| h)
            .unwrap_or(i32::MAX)
    }

    pub fn purchase_start(&self) -> i32 {
        self.fork_height(Fork::Purchase)
    }

    pub fn qpos_start(&self) -> i32 {
        self.fork_height(Fork::QPos)
    }

    pub fn tx_version_at(&self, height: i32) -> i32 {
        let fork = self.fork_at(height);
        if fork >= Fork::Feeless {
            TX_VERSION_FEELESS
        } else if fork >= Fork::Purchase {
            TX_VERSION_IMMALLEABLE
        } else if fork >= Fork::NoTxTime {
            TX_VERSION_NOTXTIME
        } else {
            TX_VERSION_GENESIS
        }
    }

    pub fn block_version_at(&self, height: i32) -> i32 {
        let fork = self.fork_at(height);
        if fork >= Fork::QPos {
            crate::block::BLOCK_VERSION_QPOS
        } else if fork >= Fork::Purchase {
            crate::block::BLOCK_VERSION_PURCHASE
        } else {
            BLOCK_VERSION_GENESIS
        }
    }

    /// Price for the next staker given the qualified roster size and current
    /// money supply. Frozen consensus rule; monotone in both arguments.
    pub fn staker_price(&self, n_qualified: u32, supply: Amount) -> Amount {
        let base = (supply.max(0) as i128) / 10_000;
        let price = base * (n_qualified as i128 + 1);
        price.min(MAX_MONEY as i128) as Amount
    }

    /// Reward for a qPoS block.
    pub fn qpos_reward(&self) -> Amount {
        self.qpos_reward
    }

    /// Reward for a PoW block at `height`, fees included. Live only below
    /// the PoW cutoff.
    pub fn pow_reward(&self, height: i32, fees: Amount) -> Amount {
        let halvings = (height / self.pow_halving_interval).clamp(0, 62) as u32;
        (self.base_pow_reward >> halvings) + fees
    }

    /// Interest on coin-days for a PoS coinstake. `coin_days` is in units of
    /// COIN * days.
    pub fn pos_reward(&self, coin_days: i64) -> Amount {
        coin_days * self.pos_annual_permille / (1_000 * 365)
    }

    /// Upper timestamp bound relative to adjusted time.
    pub fn future_drift(&self, now: i64) -> i64 {
        now + self.future_drift_secs as i64
    }

    pub fn hardened_checkpoint_ok(&self, height: i32, hash: &Hash256) -> bool {
        match self.hardened_checkpoints.get(&height) {
            Some(expected) => expected == hash,
            None => true,
        }
    }

    pub fn modifier_checkpoint_ok(&self, height: i32, checksum: u32) -> bool {
        match self.modifier_checkpoints.get(&height) {
            Some(expected) => *expected == checksum,
            None => true,
        }
    }

    /// The deterministic genesis block for this network.
    pub fn genesis_block(&self) -> Block {
        let coinbase = Transaction {
            version: TX_VERSION_GENESIS,
            time: self.genesis_time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: b"take the ghost road".to_vec(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: self.initial_supply,
                script_pubkey: ScriptPubKey::OpReturn(b"quill genesis".to_vec()),
            }],
            lock_time: 0,
        };
        let mut block = Block {
            version: BLOCK_VERSION_GENESIS,
            hash_prev: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: self.genesis_time,
            bits: self.pow_limit_bits,
            nonce: if self.is_testnet() { 0x0001_f2a1 } else { 0x0007_a430 },
            height: 0,
            staker_id: 0,
            vtx: vec![coinbase],
            signature: Vec::new(),
        };
        block.merkle_root = block.build_merkle_root();
        block
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_lookup_is_monotone() {
        let params = ChainParams::testnet();
        assert_eq!(params.fork_at(0), Fork::Launch);
        assert_eq!(params.fork_at(359), Fork::NoTxTime);
        assert_eq!(params.fork_at(360), Fork::Purchase);
        assert_eq!(params.fork_at(480), Fork::QPos);
        assert_eq!(params.fork_at(10_000), Fork::MissFix);
        assert_eq!(params.purchase_start(), 360);
        assert_eq!(params.qpos_start(), 480);
    }

    #[test]
    fn staker_price_is_monotone() {
        let params = ChainParams::mainnet();
        let supply = 24_600_000 * COIN;
        let p0 = params.staker_price(0, supply);
        let p1 = params.staker_price(1, supply);
        let p9 = params.staker_price(9, supply);
        assert!(p0 > 0);
        assert!(p1 > p0);
        assert!(p9 > p1);
        assert!(params.staker_price(u32::MAX, MAX_MONEY) <= MAX_MONEY);
    }

    #[test]
    fn genesis_is_deterministic() {
        let params = ChainParams::testnet();
        assert_eq!(params.genesis_hash(), params.genesis_hash());
        let block = params.genesis_block();
        assert_eq!(block.merkle_root, block.build_merkle_root());
        assert_eq!(block.total_output_value(), params.initial_supply);
    }
}
