//! Applying and undoing a block's effects on the transaction index and the
//! registry. All durable writes go through the active batch; nothing is
//! observable until the batch commits.

use tracing::debug;

use quill_core::{
    script::spend_digest, Amount, Block, Decodable, Fork, ProofType, PubKey, ScriptPubKey,
    Transaction,
};
use quill_crypto::KeyError;
use quill_registry::{parse_qpos_output, QposOp, QpRegistry, SnapshotType};
use quill_storage::{SnapshotWriter, TxDiskPos, TxIndexEntry};

use crate::error::ConsensusError;
use crate::index::NodeId;
use crate::state::ChainState;

impl ChainState {
    /// Re-read a block's raw bytes and decode it.
    pub fn read_block(&self, node: NodeId) -> Result<Block, ConsensusError> {
        let entry = self.index.entry(node);
        let bytes = self.files.read_block(&entry.pos)?;
        let block = Block::from_bytes(&bytes)?;
        if block.hash(&self.params) != entry.hash {
            return Err(ConsensusError::ReplayFailed(format!(
                "block at height {} does not hash to its index entry",
                entry.height
            )));
        }
        Ok(block)
    }

    /// Read one transaction back through its disk position.
    pub fn read_tx(&self, pos: &TxDiskPos) -> Result<Transaction, ConsensusError> {
        let bytes = self.files.read_block(&pos.block_pos)?;
        let block = Block::from_bytes(&bytes)?;
        block
            .vtx
            .get(pos.n_tx as usize)
            .cloned()
            .ok_or_else(|| ConsensusError::ReplayFailed("tx offset out of range".into()))
    }

    /// Validate and apply `block` at index node `node` on top of the current
    /// tx index, advancing `registry` past it. The caller owns batch
    /// handling and best-chain pointers.
    pub fn connect_block(
        &mut self,
        block: &Block,
        node: NodeId,
        registry: &mut QpRegistry,
        snap_type: SnapshotType,
    ) -> Result<(), ConsensusError> {
        let height = self.index.entry(node).height;
        let hash = self.index.entry(node).hash;
        let block_pos = self.index.entry(node).pos;
        let prev = self.index.entry(node).prev;
        let fork = self.params.fork_at(height);

        let mut fees: Amount = 0;
        let mut stake_reward: Amount = 0;
        let mut purchases_locked: Amount = 0;

        for (n_tx, tx) in block.vtx.iter().enumerate() {
            let txid = tx.txid();
            let this_pos = TxDiskPos::new(block_pos, n_tx as u32);

            if !tx.is_final(height, block.time as i64) {
                return Err(ConsensusError::BadTimestamp);
            }

            // qPoS output conventions: a purchase output carries exactly the
            // price it pays; every other operation output carries nothing
            let mut tx_ops = Vec::new();
            let mut claim_in: Amount = 0;
            for out in &tx.vout {
                if let ScriptPubKey::Qpos { tag, payload } = &out.script_pubkey {
                    let op = parse_qpos_output(*tag, payload, self.params.network)?;
                    match &op {
                        QposOp::Purchase { value, .. } => {
                            if out.value != *value {
                                return Err(ConsensusError::ValueOutOfRange);
                            }
                            purchases_locked += *value;
                        }
                        QposOp::Claim { value, .. } => {
                            if out.value != 0 {
                                return Err(ConsensusError::ValueOutOfRange);
                            }
                            claim_in += *value;
                        }
                        _ => {
                            if out.value != 0 {
                                return Err(ConsensusError::ValueOutOfRange);
                            }
                        }
                    }
                    tx_ops.push(op);
                }
            }
            if !tx_ops.is_empty() && fork < Fork::Purchase {
                return Err(ConsensusError::BadProof("qPoS operation before activation"));
            }

            if tx.is_coinbase() {
                self.db
                    .update_tx_index(&txid, &TxIndexEntry::new(this_pos, height, block.time, tx.vout.len()))?;
                continue;
            }

            let mut value_in: Amount = 0;
            let mut stake_coin_days: i64 = 0;
            let mut spender_keys: Vec<PubKey> = Vec::new();
            for (i, input) in tx.vin.iter().enumerate() {
                let outpoint = input.prevout;
                let mut prev_entry = self
                    .db
                    .read_tx_index(&outpoint.hash)?
                    .ok_or(ConsensusError::MissingPrevout(outpoint))?;
                if outpoint.n as usize >= prev_entry.spent.len() {
                    return Err(ConsensusError::BadProof("prevout index out of range"));
                }
                if prev_entry.output_is_spent(outpoint.n) {
                    return Err(ConsensusError::DoubleSpend(outpoint));
                }
                let prev_tx = self.read_tx(&prev_entry.pos)?;
                let out = prev_tx
                    .vout
                    .get(outpoint.n as usize)
                    .ok_or(ConsensusError::BadProof("prevout index out of range"))?;
                if (prev_tx.is_coinbase() || prev_tx.is_coinstake())
                    && height - prev_entry.height < self.params.coinbase_maturity
                {
                    return Err(ConsensusError::SpendsImmature);
                }
                match &out.script_pubkey {
                    ScriptPubKey::PayToPubKey(key) => {
                        key.verify(&spend_digest(&txid, i as u32), &input.script_sig)
                            .map_err(|e| match e {
                                KeyError::BadSignatureEncoding => {
                                    ConsensusError::BadSignatureEncoding
                                }
                                _ => ConsensusError::BadSigner,
                            })?;
                        spender_keys.push(*key);
                    }
                    // empty, data and operation outputs are unspendable
                    _ => return Err(ConsensusError::BadSigner),
                }
                value_in += out.value;
                if tx.is_coinstake() {
                    let held = (block.time as i64 - prev_entry.time as i64).max(0);
                    stake_coin_days += (out.value as i128 * held as i128 / 86_400) as i64;
                }
                prev_entry.spent[outpoint.n as usize] = this_pos;
                self.db.update_tx_index(&outpoint.hash, &prev_entry)?;
            }

            // registry operations must be signed by an authorized key that
            // actually spends in this transaction
            for op in &tx_ops {
                let signers = registry.authorized_signers(op)?;
                if !signers.is_empty() && !signers.iter().any(|k| spender_keys.contains(k)) {
                    return Err(ConsensusError::BadSigner);
                }
            }

            let value_out = tx.total_output_value();
            if tx.is_coinstake() {
                let reward = value_out - value_in;
                if reward < 0 {
                    return Err(ConsensusError::InputsBelowOutputs);
                }
                if reward > self.params.pos_reward(stake_coin_days) {
                    return Err(ConsensusError::BadProof("stake reward too high"));
                }
                stake_reward = reward;
            } else {
                if value_in + claim_in < value_out {
                    return Err(ConsensusError::InputsBelowOutputs);
                }
                fees += value_in + claim_in - value_out;
            }

            self.db
                .update_tx_index(&txid, &TxIndexEntry::new(this_pos, height, block.time, tx.vout.len()))?;
        }

        // proof-specific reward ceiling and mint accounting; value locked
        // into the registry by purchases counts as minted in every era
        let coinbase_out = block.vtx[0].total_output_value();
        let mint = match block.proof_type() {
            ProofType::Pow => {
                if coinbase_out > self.params.pow_reward(height, fees) {
                    return Err(ConsensusError::BadProof("coinbase reward too high"));
                }
                coinbase_out - fees + purchases_locked
            }
            ProofType::Pos => {
                if coinbase_out != 0 {
                    return Err(ConsensusError::BadProof("coinbase pays in a PoS block"));
                }
                stake_reward + purchases_locked
            }
            ProofType::QPos => {
                if coinbase_out != 0 {
                    return Err(ConsensusError::BadProof("coinbase pays in a qPoS block"));
                }
                self.params.qpos_reward() + purchases_locked
            }
        };

        self.check_block_signature(block, registry)?;

        let prev_info = match prev {
            Some(p) => self.index.entry(p).block_info(),
            None => self.index.entry(node).block_info(),
        };
        {
            let entry = self.index.entry_mut(node);
            entry.mint = mint;
            entry.money_supply = prev_info.money_supply + mint;
        }
        let info = self.index.entry(node).block_info();
        let ops = self.index.entry(node).qpos_ops.clone();

        {
            let ChainState { db, params, .. } = self;
            let params: &quill_core::ChainParams = params;
            let mut sink = SnapshotWriter { db, params };
            registry.update_on_new_block(&info, &prev_info, &ops, snap_type, &mut sink, params)?;
        }
        self.index.entry_mut(node).pico_power = registry.pico_power();

        debug!(height, %hash, mint, "connected block");
        Ok(())
    }

    /// Signature over the block hash: the scheduled staker's delegate key
    /// for qPoS, the staked output's key for PoS, nothing for PoW.
    pub fn check_block_signature(
        &self,
        block: &Block,
        registry: &QpRegistry,
    ) -> Result<(), ConsensusError> {
        let hash = block.hash(&self.params);
        match block.proof_type() {
            ProofType::Pow => Ok(()),
            ProofType::QPos => {
                let staker = registry
                    .staker(block.staker_id)
                    .ok_or(ConsensusError::BadBlockSignature)?;
                staker
                    .delegate
                    .verify(&hash.0, &block.signature)
                    .map_err(|_| ConsensusError::BadBlockSignature)
            }
            ProofType::Pos => {
                let key = block.vtx[1]
                    .vout
                    .iter()
                    .find_map(|out| out.script_pubkey.pay_to())
                    .ok_or(ConsensusError::BadBlockSignature)?;
                key.verify(&hash.0, &block.signature)
                    .map_err(|_| ConsensusError::BadBlockSignature)
            }
        }
    }

    /// Undo a block's transaction-index effects, newest transaction first.
    /// The registry is never rewound incrementally; reorganization restores
    /// it from a snapshot.
    pub fn disconnect_block(&mut self, block: &Block, node: NodeId) -> Result<(), ConsensusError> {
        let height = self.index.entry(node).height;
        for tx in block.vtx.iter().rev() {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                for input in tx.vin.iter().rev() {
                    let outpoint = input.prevout;
                    let mut prev_entry =
                        self.db
                            .read_tx_index(&outpoint.hash)?
                            .ok_or_else(|| {
                                ConsensusError::ReplayFailed(
                                    "missing prevout while disconnecting".into(),
                                )
                            })?;
                    if (outpoint.n as usize) < prev_entry.spent.len() {
                        prev_entry.spent[outpoint.n as usize] = TxDiskPos::null();
                    }
                    self.db.update_tx_index(&outpoint.hash, &prev_entry)?;
                }
            }
            self.db.erase_tx_index(&txid)?;
        }
        debug!(height, "disconnected block");
        Ok(())
    }
}
