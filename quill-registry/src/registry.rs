//! The registry proper: who may produce each block, what they earn, and how
//! the whole structure advances block-by-block and round-by-round. Advancing
//! is strictly deterministic — replaying the same block sequence from any
//! snapshot must reproduce the identical serialized state.

use std::collections::BTreeMap;

use rand_mt::Mt19937GenRand32;
use tracing::{debug, info};

use quill_core::{
    Amount, ChainParams, CodecError, Decodable, Encodable, Fork, Hash256, Reader,
};
use quill_crypto::{chain9, sha256d, PubKey};

use crate::alias::{alias_is_valid, to_lowercase_safe};
use crate::bits::BitWindow;
use crate::error::RegistryError;
use crate::meta::{check_meta_key, check_meta_value, KeyAuthority};
use crate::nft::nfts;
use crate::ops::{KeyRole, QposOp};
use crate::power::PowerRound;
use crate::queue::QpQueue;
use crate::staker::QpStaker;
use crate::QP_REGISTRY_RECENT_BLOCKS;

const REGISTRY_VERSION: i32 = 1;

/// Snapshot cadence policy for a registry advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    /// Temporary advances (producer lookahead) never persist.
    None,
    /// Deep replay: old snapshots are thinned as they are written.
    Sparse,
    /// Normal operation near the tip.
    All,
}

/// The block facts the registry needs to advance past a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub height: i32,
    pub hash: Hash256,
    pub time: u32,
    pub money_supply: Amount,
    pub staker_id: u32,
}

/// Destination for registry snapshots at boundary heights. The storage layer
/// implements this; temporary advances use [`NullSnapshotSink`].
pub trait SnapshotSink {
    fn write_registry_snapshot(
        &mut self,
        height: i32,
        registry: &QpRegistry,
        sparse: bool,
    ) -> Result<(), RegistryError>;
}

pub struct NullSnapshotSink;

impl SnapshotSink for NullSnapshotSink {
    fn write_registry_snapshot(
        &mut self,
        _height: i32,
        _registry: &QpRegistry,
        _sparse: bool,
    ) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpRegistry {
    version: i32,
    round: u32,
    round_seed: u32,
    stakers: BTreeMap<u32, QpStaker>,
    balances: BTreeMap<PubKey, Amount>,
    last_claim: BTreeMap<PubKey, i64>,
    active_count: BTreeMap<PubKey, i32>,
    /// lowercased alias -> (staker id, display alias)
    aliases: BTreeMap<String, (u32, String)>,
    queue: QpQueue,
    queue_prev: QpQueue,
    recent_blocks: BitWindow,
    id_counter: u32,
    id_slot_prev: u32,
    current_block_was_produced: bool,
    prev_block_was_produced: bool,
    block_height: i32,
    block_hash: Hash256,
    hash_block_last_snapshot: Hash256,
    hash_last_block_prev1_queue: Hash256,
    hash_last_block_prev2_queue: Hash256,
    hash_last_block_prev3_queue: Hash256,
    power_round_prev: PowerRound,
    power_round_current: PowerRound,
    /// staker id -> nft id
    nft_owners: BTreeMap<u32, u32>,
    /// nft id -> staker id
    nft_owner_lookup: BTreeMap<u32, u32>,
    /// Cumulative value destroyed by docking and balance purges.
    dust_reclaimed: Amount,

    // not persistent
    replay_mode: bool,
    should_rollback: bool,
}

impl QpRegistry {
    pub fn new(genesis_hash: Hash256) -> Self {
        QpRegistry {
            version: REGISTRY_VERSION,
            round: 0,
            round_seed: 0,
            stakers: BTreeMap::new(),
            balances: BTreeMap::new(),
            last_claim: BTreeMap::new(),
            active_count: BTreeMap::new(),
            aliases: BTreeMap::new(),
            queue: QpQueue::default(),
            queue_prev: QpQueue::default(),
            recent_blocks: BitWindow::new(QP_REGISTRY_RECENT_BLOCKS),
            id_counter: 0,
            id_slot_prev: 0,
            current_block_was_produced: false,
            // the very first staker ever to hold a slot cannot be penalized
            // for its predecessor
            prev_block_was_produced: true,
            block_height: 0,
            block_hash: genesis_hash,
            hash_block_last_snapshot: genesis_hash,
            hash_last_block_prev1_queue: genesis_hash,
            hash_last_block_prev2_queue: genesis_hash,
            hash_last_block_prev3_queue: genesis_hash,
            power_round_prev: PowerRound::default(),
            power_round_current: PowerRound::default(),
            nft_owners: BTreeMap::new(),
            nft_owner_lookup: BTreeMap::new(),
            dust_reclaimed: 0,
            replay_mode: true,
            should_rollback: false,
        }
    }

    // ------------------------------------------------------------------
    // read surface

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn round_seed(&self) -> u32 {
        self.round_seed
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn block_hash(&self) -> Hash256 {
        self.block_hash
    }

    pub fn id_counter(&self) -> u32 {
        self.id_counter
    }

    pub fn next_id(&self) -> u32 {
        self.id_counter + 1
    }

    pub fn is_in_replay_mode(&self) -> bool {
        self.replay_mode
    }

    pub fn should_rollback(&self) -> bool {
        self.should_rollback
    }

    pub fn queue(&self) -> &QpQueue {
        &self.queue
    }

    pub fn queue_prev(&self) -> &QpQueue {
        &self.queue_prev
    }

    pub fn staker(&self, id: u32) -> Option<&QpStaker> {
        self.stakers.get(&id)
    }

    pub fn stakers(&self) -> &BTreeMap<u32, QpStaker> {
        &self.stakers
    }

    pub fn balances(&self) -> &BTreeMap<PubKey, Amount> {
        &self.balances
    }

    pub fn dust_reclaimed(&self) -> Amount {
        self.dust_reclaimed
    }

    pub fn prev_block_was_produced(&self) -> bool {
        self.prev_block_was_produced
    }

    pub fn last_claim_for(&self, key: &PubKey) -> Option<i64> {
        self.last_claim.get(key).copied()
    }

    pub fn active_count_for(&self, key: &PubKey) -> Option<i32> {
        self.active_count.get(key).copied()
    }

    pub fn power_round_prev(&self) -> &PowerRound {
        &self.power_round_prev
    }

    pub fn power_round_current(&self) -> &PowerRound {
        &self.power_round_current
    }

    pub fn number_enabled(&self) -> u32 {
        self.stakers.values().filter(|s| s.is_enabled()).count() as u32
    }

    pub fn number_disabled(&self) -> u32 {
        self.stakers.values().filter(|s| s.is_disabled()).count() as u32
    }

    pub fn number_qualified(&self) -> u32 {
        self.stakers.values().filter(|s| !s.is_disqualified()).count() as u32
    }

    pub fn number_disqualified(&self) -> u32 {
        self.stakers.values().filter(|s| s.is_disqualified()).count() as u32
    }

    pub fn number_productive(&self) -> u32 {
        self.stakers.values().filter(|s| s.is_productive()).count() as u32
    }

    pub fn total_earned(&self) -> Amount {
        self.stakers.values().map(|s| s.total_earned).sum()
    }

    pub fn seniority(&self, id: u32) -> u32 {
        debug_assert!(id > 0 && id <= self.id_counter);
        (self.id_counter + 1).saturating_sub(id)
    }

    pub fn staker_weight(&self, id: u32) -> Result<u32, RegistryError> {
        let staker = self.stakers.get(&id).ok_or(RegistryError::NoSuchStaker(id))?;
        Ok(staker.weight(self.seniority(id)))
    }

    pub fn balance_for_key(&self, key: &PubKey) -> Option<Amount> {
        self.balances.get(key).copied()
    }

    pub fn key_is_inactive(&self, key: &PubKey) -> Option<bool> {
        self.active_count.get(key).map(|c| *c <= 0)
    }

    pub fn alias_is_available(&self, alias: &str) -> Result<String, RegistryError> {
        if !alias_is_valid(alias) {
            return Err(RegistryError::AliasInvalid(alias.to_string()));
        }
        let lower = to_lowercase_safe(alias);
        if self.aliases.contains_key(&lower) {
            return Err(RegistryError::AliasTaken(alias.to_string()));
        }
        Ok(lower)
    }

    pub fn id_for_alias(&self, alias: &str) -> Option<u32> {
        self.aliases.get(&to_lowercase_safe(alias)).map(|(id, _)| *id)
    }

    pub fn alias_for_id(&self, id: u32) -> Option<&str> {
        self.stakers.get(&id).map(|s| s.alias())
    }

    pub fn nft_owner(&self, nft_id: u32) -> Option<u32> {
        self.nft_owner_lookup.get(&nft_id).copied()
    }

    pub fn nft_is_available(&self, nft_id: u32, params: &ChainParams) -> bool {
        nfts(params.network).contains_key(&nft_id) && !self.nft_owner_lookup.contains_key(&nft_id)
    }

    /// Stakers advertising a certified node address in their metadata.
    pub fn certified_nodes(&self) -> Vec<(u32, String)> {
        self.stakers
            .iter()
            .filter_map(|(id, s)| s.get_meta("certified_node").map(|v| (*id, v.to_string())))
            .collect()
    }

    // ------------------------------------------------------------------
    // picopower

    pub fn pico_power(&self) -> u64 {
        let produced = self.power_round_prev.weight() + self.power_round_current.weight();
        let total = self.power_round_prev.total_weight() + self.power_round_current.total_weight();
        if total == 0 {
            return 0;
        }
        produced * crate::TRIL / total
    }

    pub fn pico_power_prev(&self) -> u64 {
        self.power_round_prev.pico_power()
    }

    pub fn pico_power_current(&self) -> u64 {
        self.power_round_current.pico_power()
    }

    pub fn has_enough_power(&self, params: &ChainParams) -> bool {
        self.power_round_prev.is_empty() || self.pico_power() >= params.min_pico_power
    }

    // ------------------------------------------------------------------
    // replay mode

    pub fn enter_replay_mode(&mut self) {
        self.replay_mode = true;
    }

    /// Manual replay exit, to kickstart block production. Testnet only.
    pub fn exit_replay_mode(&mut self, params: &ChainParams) {
        if params.is_testnet() {
            self.replay_mode = false;
        }
    }

    /// Called by the sync thread: leave replay once the registry has caught
    /// up with real time and the chain holds enough producing power.
    pub fn check_synced(&mut self, adjusted_now: i64, params: &ChainParams) {
        if self.replay_mode
            && self.has_enough_power(params)
            && self.queue.time_is_in_current_slot(adjusted_now as u32)
        {
            info!("registry caught up; exiting replay mode");
            self.replay_mode = false;
        }
    }

    // ------------------------------------------------------------------
    // schedule queries

    pub fn current_id(&self) -> u32 {
        self.queue.current_id()
    }

    pub fn id_for_prev_slot(&self) -> u32 {
        self.id_slot_prev
    }

    pub fn current_block_was_produced(&self) -> bool {
        self.current_block_was_produced
    }

    /// Is `time` a valid timestamp for a block signed by `staker_id` right
    /// now? Checks the staker's slot window and the adjusted-time bound.
    pub fn timestamp_is_valid(&self, staker_id: u32, time: u32, adjusted_now: i64) -> bool {
        let window = match self.queue.window_for_id(staker_id) {
            Some(w) => w,
            None => {
                debug!(staker_id, "timestamp check: staker not in queue");
                return false;
            }
        };
        if time < window.start || time > window.end {
            debug!(
                staker_id,
                time, window.start, window.end, "timestamp outside slot window"
            );
            return false;
        }
        if time as i64 > adjusted_now {
            debug!(staker_id, time, "qPoS block timestamp in the future");
            return false;
        }
        true
    }

    /// Which staker should sign a block for the current wall-clock moment,
    /// and whether a block should be produced at all. Advances a throwaway
    /// copy of the registry when the queue lags behind `now`.
    pub fn id_for_current_time(
        &self,
        tip: &BlockInfo,
        adjusted_now: u32,
        params: &ChainParams,
    ) -> Result<(u32, bool), RegistryError> {
        if adjusted_now < self.queue.current_slot_start() {
            // the queue can only get ahead of a badly skewed clock
            return Ok((self.queue.current_id(), false));
        }
        if adjusted_now <= self.queue.max_time() {
            if let Some(slot) = self.queue.slot_for_time(adjusted_now) {
                if slot == self.queue.current_slot() {
                    return Ok((self.queue.current_id(), !self.current_block_was_produced));
                }
                if slot < self.queue.current_slot() {
                    return Ok((self.queue.current_id(), false));
                }
            }
        }
        let mut lookahead = self.clone();
        lookahead.update_on_new_time(
            adjusted_now,
            tip,
            SnapshotType::None,
            &mut NullSnapshotSink,
            params,
        )?;
        Ok((lookahead.current_id(), true))
    }

    // ------------------------------------------------------------------
    // key activation ledger

    fn activate_key(&mut self, key: PubKey) {
        *self.active_count.entry(key).or_insert(0) += 1;
    }

    fn deactivate_key(&mut self, key: PubKey) {
        if let Some(count) = self.active_count.get_mut(&key) {
            *count -= 1;
        }
    }

    // ------------------------------------------------------------------
    // production accounting

    fn disqualify_if_necessary(&mut self, id: u32, params: &ChainParams) {
        let max_misses = params.staker_max_misses;
        if let Some(staker) = self.stakers.get_mut(&id) {
            if !staker.is_disqualified() && staker.should_be_disqualified(max_misses) {
                info!(id, "staker disqualified after miss streak");
                staker.disqualify();
            }
        }
    }

    /// Credit a produced block to the scheduled staker. Only ever called for
    /// the block extending the chain the registry is synchronized with.
    fn staker_produced_block(
        &mut self,
        id: u32,
        reward: Amount,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        let seniority = self.seniority(id);
        let staker = self.stakers.get_mut(&id).ok_or(RegistryError::NoSuchStaker(id))?;
        let weight = staker.weight(seniority);
        let (owner_reward, delegate_reward) = staker.produced_block(reward);
        let owner = staker.owner;
        let delegate = staker.delegate;
        self.power_round_current.push(id, weight, true);
        *self.balances.entry(owner).or_insert(0) += owner_reward;
        if delegate_reward > 0 {
            *self.balances.entry(delegate).or_insert(0) += delegate_reward;
        }
        self.recent_blocks.push(true);
        self.disqualify_if_necessary(id, params);
        self.current_block_was_produced = true;
        self.prev_block_was_produced = true;
        Ok(())
    }

    fn staker_missed_block(&mut self, id: u32, params: &ChainParams) -> Result<(), RegistryError> {
        let seniority = self.seniority(id);
        let staker = self.stakers.get_mut(&id).ok_or(RegistryError::NoSuchStaker(id))?;
        let weight = staker.weight(seniority);
        staker.missed_block();
        self.power_round_current.push(id, weight, false);
        self.recent_blocks.push(false);
        if !self.replay_mode {
            debug!(
                staker = id,
                round = self.round,
                slot = self.queue.current_slot(),
                pico = self.pico_power(),
                "missed block"
            );
        }
        self.disqualify_if_necessary(id, params);
        self.prev_block_was_produced = false;
        Ok(())
    }

    /// Remove disqualified stakers at a round boundary. `id_counter` never
    /// decreases; erased ids are gone for good.
    fn terminate_disqualified(&mut self, params: &ChainParams) {
        let doomed: Vec<u32> = self
            .stakers
            .iter()
            .filter(|(_, s)| s.is_disqualified())
            .map(|(id, _)| *id)
            .collect();
        if !params.erase_terminated {
            return;
        }
        for id in doomed {
            info!(id, "terminating staker");
            if let Some(staker) = self.stakers.remove(&id) {
                let lower = to_lowercase_safe(staker.alias());
                self.aliases.remove(&lower);
                if let Some(nft) = self.nft_owners.remove(&id) {
                    self.nft_owner_lookup.remove(&nft);
                }
                self.deactivate_key(staker.owner);
                if staker.delegate != staker.owner {
                    self.deactivate_key(staker.delegate);
                }
            }
        }
    }

    /// Dock every inactive key one unit of `supply / dock_inactive_fraction`
    /// and reclaim the value as dust.
    fn dock_inactive_keys(&mut self, money_supply: Amount, params: &ChainParams) {
        let dock = money_supply / params.dock_inactive_fraction;
        if dock <= 0 {
            return;
        }
        let inactive: Vec<PubKey> = self
            .active_count
            .iter()
            .filter(|(_, c)| **c <= 0)
            .map(|(k, _)| *k)
            .collect();
        for key in inactive {
            if let Some(balance) = self.balances.get_mut(&key) {
                let taken = dock.min(*balance);
                *balance -= taken;
                self.dust_reclaimed += taken;
            }
        }
    }

    /// Purge ledger entries too small to survive another dock.
    fn purge_low_balances(&mut self, money_supply: Amount, params: &ChainParams) {
        let dock = money_supply / params.dock_inactive_fraction;
        let doomed: Vec<PubKey> = self
            .balances
            .iter()
            .filter(|(_, b)| **b < dock)
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            if let Some(balance) = self.balances.remove(&key) {
                self.dust_reclaimed += balance;
            }
            self.active_count.remove(&key);
        }
    }

    // ------------------------------------------------------------------
    // queue construction

    fn derive_round_seed(prev_hash: &Hash256, params: &ChainParams) -> u32 {
        let bytes = if params.is_testnet() {
            sha256d(&prev_hash.0)
        } else {
            let mut h = prev_hash.0;
            for _ in 0..params.qp_rounds {
                h = chain9(&h);
            }
            h
        };
        u32::from_le_bytes(bytes[0..4].try_into().unwrap())
    }

    /// Build the next round's schedule: enabled stakers in ascending id
    /// order, shuffled in place by a Mersenne Twister seeded from the
    /// previous block hash.
    fn new_queue(
        &mut self,
        time0: u32,
        prev_hash: Hash256,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        let mut ids: Vec<u32> = self
            .stakers
            .iter()
            .filter(|(_, s)| s.is_enabled())
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Err(RegistryError::NoQualifiedStakers);
        }
        ids.sort_unstable();

        let seed = Self::derive_round_seed(&prev_hash, params);
        let mut mt = Mt19937GenRand32::new(seed);
        // explicit Fisher-Yates; the stdlib shuffle is not a consensus rule
        for i in 1..ids.len() {
            let j = (mt.next_u32() as usize) % (i + 1);
            ids.swap(i, j);
        }

        self.queue_prev = std::mem::take(&mut self.queue);
        self.queue = QpQueue::new(time0, ids);
        self.round += 1;
        self.round_seed = seed;
        self.power_round_prev = self.power_round_current.clone();
        self.power_round_current.set_null();
        self.hash_last_block_prev3_queue = self.hash_last_block_prev2_queue;
        self.hash_last_block_prev2_queue = self.hash_last_block_prev1_queue;
        self.hash_last_block_prev1_queue = prev_hash;
        for staker in self.stakers.values_mut() {
            staker.rotate_round();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the advance loop

    /// Advance the schedule to `now`, accounting misses, rebuilding the
    /// queue at round boundaries, and writing boundary snapshots. `prev` is
    /// the block the registry is currently synchronized with.
    pub fn update_on_new_time(
        &mut self,
        now: u32,
        prev: &BlockInfo,
        snap_type: SnapshotType,
        sink: &mut dyn SnapshotSink,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        let write_snapshot =
            snap_type != SnapshotType::None && prev.height >= params.purchase_start();

        // the registry is fully caught up with `prev` here, so boundary
        // heights snapshot before any further slot advance
        if write_snapshot
            && prev.height % params.blocks_per_snapshot == 0
            && prev.hash != self.hash_block_last_snapshot
        {
            self.hash_block_last_snapshot = prev.hash;
            sink.write_registry_snapshot(prev.height, self, snap_type == SnapshotType::Sparse)?;
            debug!(
                height = prev.height,
                round = self.round,
                seed = self.round_seed,
                pico = self.pico_power(),
                "wrote registry snapshot"
            );
        }

        if params.fork_at(prev.height + 1) >= Fork::QPos {
            if self.queue.is_empty() {
                info!(height = prev.height, "starting qPoS schedule");
                self.new_queue(prev.time + 1, prev.hash, params)?;
            }
            while self.queue.current_slot_end() < now {
                if !self.current_block_was_produced {
                    self.staker_missed_block(self.queue.current_id(), params)?;
                }
                self.id_slot_prev = self.queue.current_id();
                if !self.queue.increment_slot() {
                    self.terminate_disqualified(params);
                    self.dock_inactive_keys(prev.money_supply, params);
                    self.purge_low_balances(prev.money_supply, params);
                    let time0 = self.queue.max_time() + 1;
                    self.new_queue(time0, self.block_hash, params)?;
                }
                self.current_block_was_produced = false;
                if self.has_enough_power(params) {
                    self.should_rollback = false;
                } else {
                    self.should_rollback = true;
                    self.replay_mode = true;
                }
            }
        }
        Ok(())
    }

    /// Advance past a newly connected block: catch the schedule up to the
    /// block time, apply its staged operations, then account the production.
    pub fn update_on_new_block(
        &mut self,
        block: &BlockInfo,
        prev: &BlockInfo,
        ops: &[QposOp],
        snap_type: SnapshotType,
        sink: &mut dyn SnapshotSink,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        self.update_on_new_time(block.time, prev, snap_type, sink, params)?;

        if params.fork_at(block.height) >= Fork::Purchase && !ops.is_empty() {
            debug!(height = block.height, n = ops.len(), "applying qPoS ops");
            // purchases are priced against the supply the buyer could see
            let op_ctx = BlockInfo {
                money_supply: prev.money_supply,
                ..*block
            };
            self.apply_ops(ops, &op_ctx, params)?;
        }

        if params.fork_at(block.height) >= Fork::QPos {
            let slot = self
                .queue
                .slot_for_id(block.staker_id)
                .ok_or(RegistryError::NotInQueue(block.staker_id))?;
            if slot != self.queue.current_slot() {
                return Err(RegistryError::SlotMismatch {
                    slot,
                    current: self.queue.current_slot(),
                });
            }
            if self.current_block_was_produced && !self.replay_mode {
                return Err(RegistryError::SlotAlreadyProduced);
            }
            self.staker_produced_block(block.staker_id, params.qpos_reward(), params)?;
            for staker in self.stakers.values_mut() {
                staker.saw_block();
            }
        }

        self.block_height = block.height;
        self.block_hash = block.hash;
        Ok(())
    }

    // ------------------------------------------------------------------
    // operations

    pub fn apply_ops(
        &mut self,
        ops: &[QposOp],
        block: &BlockInfo,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        for op in ops {
            match op {
                QposOp::Purchase { .. } => self.apply_purchase(op, block, params)?,
                QposOp::SetKey { .. } => self.apply_setkey(op)?,
                QposOp::SetState { id, enable } => self.apply_setstate(*id, *enable, params)?,
                QposOp::Claim { key, value } => {
                    self.apply_claim(key, *value, block.time as i64, params)?
                }
                QposOp::SetMeta { id, key, value } => self.apply_setmeta(*id, key, value)?,
            }
        }
        Ok(())
    }

    /// New stakers are born here.
    pub fn apply_purchase(
        &mut self,
        op: &QposOp,
        block: &BlockInfo,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        let (alias, nft_id, keys, pcm, value) = match op {
            QposOp::Purchase {
                alias,
                nft_id,
                keys,
                pcm,
                value,
            } => (alias, *nft_id, keys, *pcm, *value),
            _ => return Err(RegistryError::MalformedOp("not a purchase")),
        };
        if keys.len() != 1 && keys.len() != 3 {
            return Err(RegistryError::WrongKeyCount(keys.len()));
        }
        let price = params.staker_price(self.number_qualified(), block.money_supply);
        if value < price || value > price.saturating_mul(2) {
            return Err(RegistryError::BadPrice { paid: value, price });
        }
        let lower = self.alias_is_available(alias)?;
        if nft_id != 0 && !self.nft_is_available(nft_id, params) {
            return Err(RegistryError::NftUnavailable(nft_id));
        }

        let mut staker = QpStaker::new(keys[0], value);
        if keys.len() == 3 {
            staker.delegate = keys[1];
            staker.controller = keys[2];
            if !staker.set_delegate_payout(pcm) {
                return Err(RegistryError::BadPayout(pcm));
            }
        }
        if !staker.set_alias(alias) {
            return Err(RegistryError::AliasInvalid(alias.clone()));
        }
        staker.nft_id = nft_id;

        self.id_counter += 1;
        let id = self.id_counter;
        self.activate_key(keys[0]);
        if keys.len() == 3 {
            self.activate_key(keys[1]);
        }
        if nft_id != 0 {
            self.nft_owners.insert(id, nft_id);
            self.nft_owner_lookup.insert(nft_id, id);
        }
        self.aliases.insert(lower, (id, alias.clone()));
        self.stakers.insert(id, staker);
        info!(id, alias = %alias, "registered staker");
        Ok(())
    }

    pub fn apply_setkey(&mut self, op: &QposOp) -> Result<(), RegistryError> {
        let (role, id, key, pcm) = match op {
            QposOp::SetKey { role, id, key, pcm } => (*role, *id, *key, *pcm),
            _ => return Err(RegistryError::MalformedOp("not a setkey")),
        };
        if !self.stakers.contains_key(&id) {
            return Err(RegistryError::NoSuchStaker(id));
        }
        // payout range is validated before any mutation
        if role == KeyRole::Delegate && (pcm == 0 || pcm > crate::staker::QP_PCM_MAX) {
            return Err(RegistryError::BadPayout(pcm));
        }
        let staker = self.stakers.get_mut(&id).unwrap();
        match role {
            KeyRole::Owner => {
                let old = staker.owner;
                let delegate = staker.delegate;
                staker.owner = key;
                self.deactivate_key(old);
                self.activate_key(key);
                if delegate == old && old != key {
                    // the old key remains bound as a now-distinct delegate
                    self.activate_key(old);
                }
            }
            KeyRole::Manager => {
                staker.manager = Some(key);
            }
            KeyRole::Delegate => {
                staker.set_delegate_payout(pcm);
                let old = staker.delegate;
                let owner = staker.owner;
                staker.delegate = key;
                if old != owner {
                    self.deactivate_key(old);
                }
                if key != owner {
                    self.activate_key(key);
                }
            }
            KeyRole::Controller => {
                staker.controller = key;
            }
        }
        Ok(())
    }

    /// Can a disabled staker come back? Disqualification is final, and a
    /// heavy miss record in the previous round blocks re-entry.
    pub fn can_enable_staker(&self, id: u32, params: &ChainParams) -> bool {
        match self.stakers.get(&id) {
            Some(s) => {
                s.is_disabled()
                    && !s.is_disqualified()
                    && s.round_missed_prev <= params.staker_max_misses / 2
            }
            None => false,
        }
    }

    pub fn apply_setstate(
        &mut self,
        id: u32,
        enable: bool,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        if !self.stakers.contains_key(&id) {
            return Err(RegistryError::NoSuchStaker(id));
        }
        if enable {
            if !self.can_enable_staker(id, params) {
                return Err(RegistryError::CannotEnable(id));
            }
            self.stakers.get_mut(&id).unwrap().enable();
        } else {
            self.stakers.get_mut(&id).unwrap().disable();
        }
        Ok(())
    }

    /// Read-only claim check; `claim_time` is the block time carrying the
    /// claim.
    pub fn can_claim(
        &self,
        key: &PubKey,
        value: Amount,
        claim_time: i64,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        let balance = self
            .balances
            .get(key)
            .copied()
            .ok_or(RegistryError::ClaimUnknownKey)?;
        if value <= 0 || value > balance {
            return Err(RegistryError::ClaimExceedsBalance { value, balance });
        }
        if let Some(last) = self.last_claim.get(key) {
            if !params.is_testnet() && claim_time < last + params.min_secs_per_claim as i64 {
                return Err(RegistryError::ClaimTooSoon);
            }
        }
        Ok(())
    }

    pub fn apply_claim(
        &mut self,
        key: &PubKey,
        value: Amount,
        block_time: i64,
        params: &ChainParams,
    ) -> Result<(), RegistryError> {
        self.can_claim(key, value, block_time, params)?;
        self.last_claim.insert(*key, block_time);
        let balance = self.balances.get_mut(key).ok_or(RegistryError::ClaimUnknownKey)?;
        *balance -= value;
        if *balance < 0 {
            return Err(RegistryError::BalanceUnderflow);
        }
        Ok(())
    }

    pub fn apply_setmeta(&mut self, id: u32, key: &str, value: &str) -> Result<(), RegistryError> {
        if !self.stakers.contains_key(&id) {
            return Err(RegistryError::NoSuchStaker(id));
        }
        if check_meta_key(key) == KeyAuthority::NONE {
            return Err(RegistryError::BadMetaKey(key.to_string()));
        }
        if !check_meta_value(value) {
            return Err(RegistryError::BadMetaValue);
        }
        self.stakers.get_mut(&id).unwrap().set_meta(key, value);
        Ok(())
    }

    /// Keys allowed to sign the op, resolved against the registry.
    pub fn authorized_signers(&self, op: &QposOp) -> Result<Vec<PubKey>, RegistryError> {
        if let QposOp::Claim { key, .. } = op {
            return Ok(vec![*key]);
        }
        let authority = match op.required_authority() {
            // purchases authorize by payment, not by staker key
            None => return Ok(Vec::new()),
            Some(a) => a,
        };
        let id = op.staker_id().expect("keyed op targets a staker");
        let staker = self.stakers.get(&id).ok_or(RegistryError::NoSuchStaker(id))?;
        let mut keys = Vec::new();
        if authority.permits(KeyAuthority::OWNER) {
            keys.push(staker.owner);
        }
        if authority.permits(KeyAuthority::DELEGATE) {
            keys.push(staker.delegate);
        }
        if authority.permits(KeyAuthority::CONTROLLER) {
            keys.push(staker.controller);
        }
        if authority.permits(KeyAuthority::MANAGER) {
            if let Some(manager) = staker.manager {
                keys.push(manager);
            }
        }
        Ok(keys)
    }
}

impl Encodable for QpRegistry {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.round.encode(out);
        self.round_seed.encode(out);
        self.stakers.encode(out);
        self.balances.encode(out);
        self.last_claim.encode(out);
        self.active_count.encode(out);
        self.aliases.encode(out);
        self.queue.encode(out);
        self.queue_prev.encode(out);
        self.recent_blocks.encode(out);
        self.id_counter.encode(out);
        self.id_slot_prev.encode(out);
        self.current_block_was_produced.encode(out);
        self.prev_block_was_produced.encode(out);
        self.block_height.encode(out);
        self.block_hash.encode(out);
        self.hash_block_last_snapshot.encode(out);
        self.hash_last_block_prev1_queue.encode(out);
        self.hash_last_block_prev2_queue.encode(out);
        self.hash_last_block_prev3_queue.encode(out);
        self.power_round_prev.encode(out);
        self.power_round_current.encode(out);
        self.nft_owners.encode(out);
        self.nft_owner_lookup.encode(out);
        self.dust_reclaimed.encode(out);
    }
}

impl Decodable for QpRegistry {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(QpRegistry {
            version: i32::decode(r)?,
            round: u32::decode(r)?,
            round_seed: u32::decode(r)?,
            stakers: BTreeMap::<u32, QpStaker>::decode(r)?,
            balances: BTreeMap::<PubKey, Amount>::decode(r)?,
            last_claim: BTreeMap::<PubKey, i64>::decode(r)?,
            active_count: BTreeMap::<PubKey, i32>::decode(r)?,
            aliases: BTreeMap::<String, (u32, String)>::decode(r)?,
            queue: QpQueue::decode(r)?,
            queue_prev: QpQueue::decode(r)?,
            recent_blocks: BitWindow::decode(r)?,
            id_counter: u32::decode(r)?,
            id_slot_prev: u32::decode(r)?,
            current_block_was_produced: bool::decode(r)?,
            prev_block_was_produced: bool::decode(r)?,
            block_height: i32::decode(r)?,
            block_hash: Hash256::decode(r)?,
            hash_block_last_snapshot: Hash256::decode(r)?,
            hash_last_block_prev1_queue: Hash256::decode(r)?,
            hash_last_block_prev2_queue: Hash256::decode(r)?,
            hash_last_block_prev3_queue: Hash256::decode(r)?,
            power_round_prev: PowerRound::decode(r)?,
            power_round_current: PowerRound::decode(r)?,
            nft_owners: BTreeMap::<u32, u32>::decode(r)?,
            nft_owner_lookup: BTreeMap::<u32, u32>::decode(r)?,
            dust_reclaimed: Amount::decode(r)?,
            // a freshly loaded registry replays until proven synced
            replay_mode: true,
            should_rollback: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::COIN;
    use quill_crypto::KeyPair;

    const SUPPLY: Amount = 24_600_000 * COIN;

    /// Mainnet rules with forks pulled down to small heights.
    fn fast_params() -> ChainParams {
        let mut p = ChainParams::mainnet();
        p.forks = vec![
            (0, Fork::Launch),
            (0, Fork::BlockTimeRule),
            (0, Fork::NoTxTime),
            (1, Fork::Purchase),
            (2, Fork::QPos),
            (3, Fork::Feeless),
            (4, Fork::MissFix),
        ];
        p
    }

    fn info(height: i32, time: u32) -> BlockInfo {
        BlockInfo {
            height,
            hash: Hash256([height as u8 + 1; 32]),
            time,
            money_supply: SUPPLY,
            staker_id: 0,
        }
    }

    fn purchase(alias: &str, key: PubKey, value: Amount) -> QposOp {
        QposOp::Purchase {
            alias: alias.to_string(),
            nft_id: 0,
            keys: vec![key],
            pcm: 0,
            value,
        }
    }

    fn registry_with_stakers(params: &ChainParams, n: u32) -> (QpRegistry, Vec<KeyPair>) {
        let mut registry = QpRegistry::new(params.genesis_hash());
        let mut keys = Vec::new();
        for i in 0..n {
            let kp = KeyPair::generate();
            let price = params.staker_price(registry.number_qualified(), SUPPLY);
            registry
                .apply_purchase(
                    &purchase(&format!("staker{i}"), kp.public(), price),
                    &info(1, 100),
                    params,
                )
                .unwrap();
            keys.push(kp);
        }
        (registry, keys)
    }

    #[test]
    fn purchase_then_lookup_case_insensitive() {
        let params = fast_params();
        let mut registry = QpRegistry::new(params.genesis_hash());
        let key = KeyPair::generate().public();
        let price = params.staker_price(0, SUPPLY);
        registry
            .apply_purchase(&purchase("alice", key, price), &info(1, 100), &params)
            .unwrap();
        assert_eq!(registry.id_for_alias("ALICE"), Some(1));
        assert_eq!(registry.id_counter(), 1);
        assert!(registry.staker(1).unwrap().is_enabled());
        assert!(registry.balances().is_empty());
        assert_eq!(registry.staker(1).unwrap().price_paid, price);
    }

    #[test]
    fn purchase_price_window() {
        let params = fast_params();
        let mut registry = QpRegistry::new(params.genesis_hash());
        let key = KeyPair::generate().public();
        let price = params.staker_price(0, SUPPLY);
        let low = registry.apply_purchase(&purchase("alice", key, price - 1), &info(1, 100), &params);
        assert!(matches!(low, Err(RegistryError::BadPrice { .. })));
        let high =
            registry.apply_purchase(&purchase("alice", key, price * 2 + 1), &info(1, 100), &params);
        assert!(matches!(high, Err(RegistryError::BadPrice { .. })));
        registry
            .apply_purchase(&purchase("alice", key, price * 2), &info(1, 100), &params)
            .unwrap();
    }

    #[test]
    fn duplicate_alias_rejected_case_insensitive() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 1);
        let key = KeyPair::generate().public();
        let price = params.staker_price(registry.number_qualified(), SUPPLY);
        let err = registry.apply_purchase(&purchase("STAKER0", key, price), &info(1, 100), &params);
        assert!(matches!(err, Err(RegistryError::AliasTaken(_))));
    }

    #[test]
    fn three_key_purchase_validates_payout() {
        let params = fast_params();
        let mut registry = QpRegistry::new(params.genesis_hash());
        let keys = vec![
            KeyPair::generate().public(),
            KeyPair::generate().public(),
            KeyPair::generate().public(),
        ];
        let price = params.staker_price(0, SUPPLY);
        let op = QposOp::Purchase {
            alias: "trio".to_string(),
            nft_id: 0,
            keys: keys.clone(),
            pcm: 0,
            value: price,
        };
        assert!(matches!(
            registry.apply_purchase(&op, &info(1, 100), &params),
            Err(RegistryError::BadPayout(0))
        ));
        let op = QposOp::Purchase {
            alias: "trio".to_string(),
            nft_id: 0,
            keys,
            pcm: 40_000,
            value: price,
        };
        registry.apply_purchase(&op, &info(1, 100), &params).unwrap();
        let staker = registry.staker(1).unwrap();
        assert_ne!(staker.owner, staker.delegate);
        assert_eq!(staker.delegate_payout_pcm(), 40_000);
    }

    #[test]
    fn claim_interval_enforced_on_mainnet() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 1);
        let owner = keys[0].public();
        registry.balances.insert(owner, 1000);
        registry
            .apply_claim(&owner, 100, 50_000, &params)
            .unwrap();
        assert_eq!(registry.balance_for_key(&owner), Some(900));
        // 100 seconds later is far under the 1-day minimum
        assert_eq!(
            registry.apply_claim(&owner, 50, 50_100, &params),
            Err(RegistryError::ClaimTooSoon)
        );
        registry
            .apply_claim(&owner, 50, 50_000 + params.min_secs_per_claim as i64, &params)
            .unwrap();
        assert_eq!(registry.balance_for_key(&owner), Some(850));
    }

    #[test]
    fn claim_cannot_exceed_balance() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 1);
        let owner = keys[0].public();
        registry.balances.insert(owner, 10);
        assert!(matches!(
            registry.apply_claim(&owner, 11, 1, &params),
            Err(RegistryError::ClaimExceedsBalance { .. })
        ));
        let stranger = KeyPair::generate().public();
        assert_eq!(
            registry.apply_claim(&stranger, 1, 1, &params),
            Err(RegistryError::ClaimUnknownKey)
        );
    }

    #[test]
    fn queue_is_deterministic_for_equal_state() {
        let params = fast_params();
        let (mut a, _) = registry_with_stakers(&params, 5);
        let mut b = a.clone();
        let prev = info(2, 1000);
        a.update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        b.update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        assert_eq!(a.queue().slot_ids(), b.queue().slot_ids());
        assert_eq!(a.round_seed(), b.round_seed());
        assert_eq!(a.to_bytes(), b.to_bytes());
        // the shuffled order covers exactly the enabled roster
        let mut ids = a.queue().slot_ids().to_vec();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn missed_slots_advance_queue_and_drop_picopower() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 3);
        let prev = info(2, 1000);
        // builds the first queue anchored at prev.time + 1
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let first = registry.current_id();
        let second_start = registry.queue().window_for_slot(1).unwrap().start;
        registry
            .update_on_new_time(second_start, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        assert_eq!(registry.queue().current_slot(), 1);
        assert_eq!(registry.staker(first).unwrap().blocks_missed, 1);
        assert_eq!(registry.id_for_prev_slot(), first);
        assert!(!registry.prev_block_was_produced());
        assert_eq!(registry.pico_power_current(), 0);
    }

    #[test]
    fn full_round_of_misses_builds_next_queue() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 3);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let round1 = registry.round();
        let end = registry.queue().max_time();
        registry
            .update_on_new_time(end + 1, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        assert_eq!(registry.round(), round1 + 1);
        assert_eq!(registry.power_round_prev().len(), 3);
        // all slots missed: the chain no longer trusts itself to produce
        assert!(registry.should_rollback());
        assert!(registry.is_in_replay_mode());
        assert_eq!(registry.pico_power(), 0);
    }

    #[test]
    fn power_round_reproduces_queue_order() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 4);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let order = registry.queue().slot_ids().to_vec();
        let end = registry.queue().max_time();
        registry
            .update_on_new_time(end + 1, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let recorded: Vec<u32> = registry
            .power_round_prev()
            .elements()
            .iter()
            .map(|e| e.staker_id)
            .collect();
        assert_eq!(recorded, order, "power round follows slot order");
        assert!(registry
            .power_round_prev()
            .elements()
            .iter()
            .all(|e| !e.did_produce));
        assert_eq!(registry.queue_prev().slot_ids(), order.as_slice());
    }

    #[test]
    fn disqualification_terminates_at_round_boundary() {
        let mut params = fast_params();
        params.staker_max_misses = 2;
        let (mut registry, _) = registry_with_stakers(&params, 2);
        // age staker 1 out of the noob exemption; staker 2 keeps it
        registry.stakers.get_mut(&1).unwrap().blocks_seen = crate::QP_NOOB_BLOCKS;
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        // run several full rounds of misses
        for _ in 0..4 {
            let end = registry.queue().max_time();
            registry
                .update_on_new_time(end + 1, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
                .unwrap();
        }
        assert!(registry.staker(1).is_none(), "staker 1 erased on mainnet");
        assert!(registry.staker(2).is_some(), "noob staker survives");
        assert_eq!(registry.id_counter(), 2);
        assert!(!registry.queue().slot_ids().contains(&1));
    }

    #[test]
    fn docking_reclaims_dust_from_inactive_keys() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 2);
        let k0 = keys[0].public();
        registry.balances.insert(k0, 5);
        registry.active_count.insert(k0, 0);
        let dock = SUPPLY / params.dock_inactive_fraction;
        assert!(dock > 5);
        registry.dock_inactive_keys(SUPPLY, &params);
        registry.purge_low_balances(SUPPLY, &params);
        assert_eq!(registry.balance_for_key(&k0), None);
        assert_eq!(registry.dust_reclaimed(), 5);
    }

    #[test]
    fn setkey_swaps_activation_bindings() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 1);
        let old_owner = keys[0].public();
        let new_owner = KeyPair::generate().public();
        assert_eq!(registry.active_count_for(&old_owner), Some(1));
        registry
            .apply_setkey(&QposOp::SetKey {
                role: KeyRole::Owner,
                id: 1,
                key: new_owner,
                pcm: 0,
            })
            .unwrap();
        // the old key stays bound as the (now distinct) delegate
        assert_eq!(registry.active_count_for(&old_owner), Some(1));
        assert_eq!(registry.active_count_for(&new_owner), Some(1));
        assert_eq!(registry.staker(1).unwrap().owner, new_owner);
        assert_eq!(registry.staker(1).unwrap().delegate, old_owner);
    }

    #[test]
    fn enable_disable_policy() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 1);
        registry.apply_setstate(1, false, &params).unwrap();
        assert!(registry.staker(1).unwrap().is_disabled());
        registry.apply_setstate(1, true, &params).unwrap();
        assert!(registry.staker(1).unwrap().is_enabled());
        // heavy misses last round block re-entry
        registry.apply_setstate(1, false, &params).unwrap();
        registry.stakers.get_mut(&1).unwrap().round_missed_prev = params.staker_max_misses;
        assert_eq!(
            registry.apply_setstate(1, true, &params),
            Err(RegistryError::CannotEnable(1))
        );
    }

    #[test]
    fn setmeta_whitelist() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 1);
        registry
            .apply_setmeta(1, "certified_node", "host.example:4111")
            .unwrap();
        assert_eq!(registry.certified_nodes(), vec![(1, "host.example:4111".to_string())]);
        assert!(matches!(
            registry.apply_setmeta(1, "shoe_size", "9"),
            Err(RegistryError::BadMetaKey(_))
        ));
    }

    #[test]
    fn snapshot_roundtrip_is_exact() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 3);
        registry.balances.insert(keys[0].public(), 777);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1100, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let bytes = registry.to_bytes();
        let decoded = QpRegistry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.to_bytes(), bytes);
        // replay flags are not persistent state
        assert!(decoded.is_in_replay_mode());
    }

    #[test]
    fn produced_block_credits_and_schedules() {
        let params = fast_params();
        let (mut registry, keys) = registry_with_stakers(&params, 2);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let producer = registry.current_id();
        let block_time = registry.queue().current_slot_start();
        let block = BlockInfo {
            height: 3,
            hash: Hash256([0xaa; 32]),
            time: block_time,
            money_supply: SUPPLY,
            staker_id: producer,
        };
        registry
            .update_on_new_block(&block, &prev, &[], SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let owner = registry.staker(producer).unwrap().owner;
        assert_eq!(registry.balance_for_key(&owner), Some(params.qpos_reward()));
        assert_eq!(registry.block_height(), 3);
        assert_eq!(registry.block_hash(), Hash256([0xaa; 32]));
        assert!(registry.current_block_was_produced());
        let _ = keys;
        // a second block for the same slot is rejected once out of replay
        let mut synced = registry.clone();
        synced.replay_mode = false;
        let err = synced.update_on_new_block(
            &block,
            &prev,
            &[],
            SnapshotType::None,
            &mut NullSnapshotSink,
            &params,
        );
        assert_eq!(err, Err(RegistryError::SlotAlreadyProduced));
    }

    #[test]
    fn wrong_slot_producer_rejected() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 3);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let wrong = registry.queue().id_for_slot(1).unwrap();
        let block = BlockInfo {
            height: 3,
            hash: Hash256([0xbb; 32]),
            time: registry.queue().current_slot_start(),
            money_supply: SUPPLY,
            staker_id: wrong,
        };
        let err = registry.update_on_new_block(
            &block,
            &prev,
            &[],
            SnapshotType::None,
            &mut NullSnapshotSink,
            &params,
        );
        assert!(matches!(err, Err(RegistryError::SlotMismatch { .. })));
    }

    #[test]
    fn timestamp_window_validation() {
        let params = fast_params();
        let (mut registry, _) = registry_with_stakers(&params, 2);
        let prev = info(2, 1000);
        registry
            .update_on_new_time(1001, &prev, SnapshotType::None, &mut NullSnapshotSink, &params)
            .unwrap();
        let id = registry.current_id();
        let w = registry.queue().window_for_id(id).unwrap();
        let far_future = (w.end + 1000) as i64;
        assert!(registry.timestamp_is_valid(id, w.start, far_future));
        assert!(registry.timestamp_is_valid(id, w.end, far_future));
        assert!(!registry.timestamp_is_valid(id, w.start - 1, far_future));
        assert!(!registry.timestamp_is_valid(id, w.end + 1, far_future));
        // a timestamp ahead of adjusted time fails even inside the window
        assert!(!registry.timestamp_is_valid(id, w.end, w.start as i64 - 1));
        assert!(!registry.timestamp_is_valid(9999, w.start, far_future));
    }

    #[test]
    fn nft_purchase_assigns_ownership_once() {
        let mut params = fast_params();
        params.network = quill_core::Network::Testnet;
        let mut registry = QpRegistry::new(params.genesis_hash());
        let price = params.staker_price(0, SUPPLY);
        let op = QposOp::Purchase {
            alias: "Testa".to_string(),
            nft_id: 1,
            keys: vec![KeyPair::generate().public()],
            pcm: 0,
            value: price,
        };
        registry.apply_purchase(&op, &info(1, 100), &params).unwrap();
        assert_eq!(registry.nft_owner(1), Some(1));
        assert!(!registry.nft_is_available(1, &params));
        let price2 = params.staker_price(1, SUPPLY);
        let again = QposOp::Purchase {
            alias: "Resta".to_string(),
            nft_id: 1,
            keys: vec![KeyPair::generate().public()],
            pcm: 0,
            value: price2,
        };
        assert!(matches!(
            registry.apply_purchase(&again, &info(1, 100), &params),
            Err(RegistryError::NftUnavailable(1))
        ));
    }
}
