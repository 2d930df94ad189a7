//! A small chain-building harness: mines PoW funding blocks, registers
//! stakers, and produces schedule blocks signed with the right keys — all
//! against a real on-disk state.

use std::collections::BTreeMap;

use quill_chain::{ChainState, ConsensusError, ManualClock, ShutdownFlag};
use quill_core::{
    block::check_proof_of_work, script::spend_digest, Amount, Block, ChainParams, Fork, Hash256,
    OutPoint, QposOpTag, ScriptPubKey, Transaction, TxIn, TxOut, COIN,
};
use quill_crypto::{KeyPair, PubKey};
use quill_registry::BlockInfo;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub params: ChainParams,
    pub state: ChainState,
    pub clock: ManualClock,
    pub shutdown: ShutdownFlag,
    /// Every block accepted through this harness, in acceptance order.
    pub blocks: Vec<Block>,
    /// Staker id -> the single keypair acting as owner/delegate/controller.
    pub staker_keys: BTreeMap<u32, KeyPair>,
}

/// Mainnet rules with forks pulled down, an easy PoW target, and small
/// snapshot cadence so short test chains cross boundaries.
pub fn test_params(qpos_at: i32) -> ChainParams {
    let mut p = ChainParams::mainnet();
    p.forks = vec![
        (0, Fork::Launch),
        (0, Fork::BlockTimeRule),
        (0, Fork::NoTxTime),
        (1, Fork::Purchase),
        (qpos_at, Fork::QPos),
        (100_000, Fork::Feeless),
        (100_000, Fork::MissFix),
    ];
    p.pow_limit_bits = 0x2100_ffff;
    p.pow_cutoff_height = qpos_at.max(1_000);
    p.coinbase_maturity = 2;
    p.blocks_per_snapshot = 4;
    p.recent_snapshots = 4;
    p.sparse_snapshot_interval = 16;
    p.initial_supply = 1_000 * COIN;
    p.genesis_time = 1_000_000;
    p
}

impl Harness {
    pub fn new(params: ChainParams) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ChainState::open(params.clone(), dir.path()).unwrap();
        let shutdown = ShutdownFlag::new();
        let clock = ManualClock::new(params.genesis_time as i64 + 100);
        state.load_block_index(&clock, &shutdown, 1, 0).unwrap();
        Harness {
            dir,
            params,
            state,
            clock,
            shutdown,
            blocks: Vec::new(),
            staker_keys: BTreeMap::new(),
        }
    }

    pub fn tip_info(&self) -> BlockInfo {
        self.state.best_entry().unwrap().block_info()
    }

    pub fn supply(&self) -> Amount {
        self.tip_info().money_supply
    }

    /// Accept a block built elsewhere (e.g. by a sibling harness).
    pub fn feed_block(&mut self, block: &Block) -> Result<Hash256, ConsensusError> {
        self.clock.set(block.time as i64 + 100);
        let hash = self.state.process_block(block, &self.clock)?;
        self.blocks.push(block.clone());
        Ok(hash)
    }

    fn submit(&mut self, block: Block) -> Result<Hash256, ConsensusError> {
        self.clock.set(block.time as i64 + 5);
        let hash = self.state.process_block(&block, &self.clock)?;
        self.blocks.push(block);
        Ok(hash)
    }

    /// Mine a PoW block paying the subsidy to `key`, carrying `txs`.
    pub fn mine_pow(&mut self, key: &KeyPair, txs: Vec<Transaction>) -> (Hash256, OutPoint, Amount) {
        self.try_mine_pow(key, txs).expect("pow block accepted")
    }

    pub fn try_mine_pow(
        &mut self,
        key: &KeyPair,
        txs: Vec<Transaction>,
    ) -> Result<(Hash256, OutPoint, Amount), ConsensusError> {
        let tip = self.tip_info();
        let height = tip.height + 1;
        let time = tip.time + 10;
        let subsidy = self.params.pow_reward(height, 0);
        let coinbase = coinbase_tx(&self.params, height, time, subsidy, Some(key.public()));
        let coinbase_txid = coinbase.txid();
        let mut vtx = vec![coinbase];
        vtx.extend(txs);
        let mut block = Block {
            version: self.params.block_version_at(height),
            hash_prev: tip.hash,
            merkle_root: Hash256::ZERO,
            time,
            bits: self.params.pow_limit_bits,
            nonce: 0,
            height: 0,
            staker_id: 0,
            vtx,
            signature: Vec::new(),
        };
        block.merkle_root = block.build_merkle_root();
        while !check_proof_of_work(&block.hash(&self.params), block.bits) {
            block.nonce += 1;
        }
        let hash = self.submit(block)?;
        Ok((hash, OutPoint::new(coinbase_txid, 0), subsidy))
    }

    /// The timestamp the next qPoS block should carry, given the current
    /// schedule. `offset` shifts inside the slot window (branch divergence).
    pub fn next_qpos_time(&self, offset: u32) -> u32 {
        let tip = self.tip_info();
        let registry = &self.state.registry;
        let base = if registry.queue().is_empty() {
            tip.time + 1
        } else if registry.current_block_was_produced() {
            registry.queue().current_slot_end() + 1
        } else {
            registry.queue().current_slot_start().max(tip.time + 1)
        };
        base + offset
    }

    /// Produce the scheduled qPoS block at `time`, carrying `txs`.
    pub fn produce_qpos_at(
        &mut self,
        time: u32,
        txs: Vec<Transaction>,
    ) -> Result<Hash256, ConsensusError> {
        let tip = self.tip_info();
        let height = tip.height + 1;
        let (staker_id, _should_produce) = self
            .state
            .registry
            .id_for_current_time(&tip, time, &self.params)?;
        let signer = self
            .staker_keys
            .get(&staker_id)
            .unwrap_or_else(|| panic!("no key for staker {staker_id}"))
            .clone();
        let coinbase = coinbase_tx(&self.params, height, time, 0, None);
        let mut vtx = vec![coinbase];
        vtx.extend(txs);
        let mut block = Block {
            version: self.params.block_version_at(height),
            hash_prev: tip.hash,
            merkle_root: Hash256::ZERO,
            time,
            bits: self.params.pow_limit_bits,
            nonce: 0,
            height,
            staker_id,
            vtx,
            signature: Vec::new(),
        };
        block.merkle_root = block.build_merkle_root();
        let hash = block.hash(&self.params);
        block.signature = signer.sign(&hash.0);
        self.submit(block)
    }

    pub fn produce_qpos(&mut self, txs: Vec<Transaction>) -> Hash256 {
        let time = self.next_qpos_time(0);
        self.produce_qpos_at(time, txs).expect("qpos block accepted")
    }

    /// Buy a single-key staker with `alias`, funded from `funding`.
    /// Registers the staker's keypair for later block signing.
    pub fn purchase_staker(
        &mut self,
        funding: (OutPoint, Amount, &KeyPair),
        staker: &KeyPair,
        alias: &str,
    ) -> Transaction {
        let price = self
            .params
            .staker_price(self.state.registry.number_qualified(), self.supply());
        let payload = purchase_payload(price as u64, &[staker.public()], None, alias.as_bytes());
        let outputs = vec![
            TxOut {
                value: price,
                script_pubkey: ScriptPubKey::Qpos {
                    tag: QposOpTag::Purchase1,
                    payload,
                },
            },
            TxOut {
                value: funding.1 - price,
                script_pubkey: ScriptPubKey::PayToPubKey(funding.2.public()),
            },
        ];
        let expected_id = self.state.registry.next_id();
        self.staker_keys.insert(expected_id, staker.clone());
        signed_tx(&[(funding.0, funding.2)], outputs)
    }

    /// A claim of `value` from the registry ledger, authorized by spending
    /// `funding` with the claim key itself.
    pub fn claim_tx(&self, funding: (OutPoint, Amount, &KeyPair), value: Amount) -> Transaction {
        let key = funding.2.public();
        let mut payload = key.as_bytes().to_vec();
        payload.extend_from_slice(&(value as u64).to_le_bytes());
        let outputs = vec![
            TxOut {
                value: funding.1 + value,
                script_pubkey: ScriptPubKey::PayToPubKey(key),
            },
            TxOut {
                value: 0,
                script_pubkey: ScriptPubKey::Qpos {
                    tag: QposOpTag::Claim,
                    payload,
                },
            },
        ];
        signed_tx(&[(funding.0, funding.2)], outputs)
    }

    /// Replay the registry from genesis over the current main chain,
    /// without consulting any snapshot.
    pub fn replay_registry_from_zero(&self) -> quill_registry::QpRegistry {
        use quill_registry::{NullSnapshotSink, QpRegistry, SnapshotType};
        let mut registry = QpRegistry::new(self.params.genesis_hash());
        for height in 1..=self.state.best_height() {
            let node = self.state.index.at_height(height).unwrap();
            let prev = self.state.index.entry(node).prev.unwrap();
            let info = self.state.index.entry(node).block_info();
            let prev_info = self.state.index.entry(prev).block_info();
            let ops = self.state.index.entry(node).qpos_ops.clone();
            registry
                .update_on_new_block(
                    &info,
                    &prev_info,
                    &ops,
                    SnapshotType::All,
                    &mut NullSnapshotSink,
                    &self.params,
                )
                .unwrap();
        }
        registry
    }
}

pub fn coinbase_tx(
    params: &ChainParams,
    height: i32,
    time: u32,
    value: Amount,
    pay_to: Option<PubKey>,
) -> Transaction {
    let mut tag = height.to_le_bytes().to_vec();
    tag.extend_from_slice(&time.to_le_bytes());
    let script_pubkey = match pay_to {
        Some(key) => ScriptPubKey::PayToPubKey(key),
        None => ScriptPubKey::OpReturn(tag.clone()),
    };
    Transaction {
        version: params.tx_version_at(height),
        time: 0,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: tag,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// Build and sign a pay-to-pubkey spending transaction.
pub fn signed_tx(inputs: &[(OutPoint, &KeyPair)], outputs: Vec<TxOut>) -> Transaction {
    let mut tx = Transaction {
        version: quill_core::tx::TX_VERSION_IMMALLEABLE,
        time: 0,
        vin: inputs
            .iter()
            .map(|(prevout, _)| TxIn {
                prevout: *prevout,
                script_sig: Vec::new(),
                sequence: u32::MAX,
            })
            .collect(),
        vout: outputs,
        lock_time: 0,
    };
    let txid = tx.txid();
    for (i, (_, key)) in inputs.iter().enumerate() {
        tx.vin[i].script_sig = key.sign(&spend_digest(&txid, i as u32));
    }
    tx
}

pub fn purchase_payload(
    value: u64,
    keys: &[PubKey],
    pcm: Option<u32>,
    alias: &[u8],
) -> Vec<u8> {
    let mut payload = value.to_le_bytes().to_vec();
    for key in keys {
        payload.extend_from_slice(key.as_bytes());
    }
    if let Some(pcm) = pcm {
        payload.extend_from_slice(&pcm.to_le_bytes());
    }
    payload.extend_from_slice(alias);
    payload
}

/// A harness pre-built to the first qPoS round: funded keys, two registered
/// stakers (alice, bob), chain just past the qPoS fork.
pub struct QposChain {
    pub harness: Harness,
    pub alice: KeyPair,
    pub bob: KeyPair,
    /// A mature, unspent coinbase paying alice's staker key.
    pub alice_fund: (OutPoint, Amount),
}

pub fn build_qpos_chain() -> QposChain {
    let qpos_at = 8;
    let mut h = Harness::new(test_params(qpos_at));
    let funder_a = KeyPair::generate();
    let funder_b = KeyPair::generate();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    // heights 1..=5: funding
    let (_, fund_a, value_a) = h.mine_pow(&funder_a, Vec::new());
    let (_, fund_b, value_b) = h.mine_pow(&funder_b, Vec::new());
    let (_, alice_fund, alice_value) = h.mine_pow(&alice, Vec::new());
    h.mine_pow(&KeyPair::generate(), Vec::new());
    h.mine_pow(&KeyPair::generate(), Vec::new());

    // heights 6 and 7: register the stakers
    let buy_alice = h.purchase_staker((fund_a, value_a, &funder_a), &alice, "alice");
    h.mine_pow(&KeyPair::generate(), vec![buy_alice]);
    let buy_bob = h.purchase_staker((fund_b, value_b, &funder_b), &bob, "bobcat");
    h.mine_pow(&KeyPair::generate(), vec![buy_bob]);

    assert_eq!(h.state.best_height(), qpos_at - 1);
    QposChain {
        harness: h,
        alice,
        bob,
        alice_fund: (alice_fund, alice_value),
    }
}
