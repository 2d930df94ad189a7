//! All consensus state in one value: parameters, durable store, block files,
//! block index, registry, and best-chain bookkeeping. One mutex serializes
//! every mutation; readers that need a consistent view hold the same lock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_bigint::BigUint;
use parking_lot::Mutex;
use tracing::{info, warn};

use quill_core::{
    block::check_proof_of_work, money_range, Block, ChainParams, Encodable, Fork, Hash256,
    ProofType,
};
use quill_crypto::PubKey;
use quill_registry::{extract_ops, QpRegistry};
use quill_storage::{BlockFileStore, ChainDb, StoreError};

use crate::checkpoints::{CheckpointState, SyncCheckpoint};
use crate::clock::Clock;
use crate::error::ConsensusError;
use crate::index::{BlockIndex, BlockIndexEntry, NodeId, FLAG_STAKE_MODIFIER};
use crate::modifier::{compute_stake_modifier, modifier_checksum};

pub struct ChainState {
    pub params: ChainParams,
    pub db: ChainDb,
    pub files: BlockFileStore,
    pub index: BlockIndex,
    pub registry: QpRegistry,
    pub best: Option<NodeId>,
    pub best_invalid_trust: BigUint,
    pub checkpoints: CheckpointState,
}

impl ChainState {
    /// Open (or create) the chain database and block files under `datadir`.
    /// A database version mismatch wipes the index; the caller is expected
    /// to run the bootstrap, which rebuilds it from the block files.
    pub fn open(params: ChainParams, datadir: &Path) -> Result<Self, ConsensusError> {
        let index_path = datadir.join("txindex");
        let db = match ChainDb::open(&index_path) {
            Ok(db) => db,
            Err(StoreError::VersionMismatch { found, need }) => {
                warn!(found, need, "database version mismatch; rebuilding index");
                ChainDb::wipe_and_reopen(&index_path)?
            }
            Err(e) => return Err(e.into()),
        };
        let files = BlockFileStore::open(datadir.join("blocks"), params.magic)?;
        let registry = QpRegistry::new(params.genesis_hash());
        let checkpoints = CheckpointState {
            current: params.genesis_hash(),
            ..Default::default()
        };
        Ok(ChainState {
            params,
            db,
            files,
            index: BlockIndex::new(),
            registry,
            best: None,
            best_invalid_trust: BigUint::default(),
            checkpoints,
        })
    }

    pub fn best_entry(&self) -> Option<&BlockIndexEntry> {
        self.best.map(|id| self.index.entry(id))
    }

    pub fn best_height(&self) -> i32 {
        self.best_entry().map(|e| e.height).unwrap_or(-1)
    }

    pub fn best_hash(&self) -> Hash256 {
        self.best_entry()
            .map(|e| e.hash)
            .unwrap_or(self.params.genesis_hash())
    }

    pub fn best_trust(&self) -> BigUint {
        self.best_entry()
            .map(|e| e.chain_trust.clone())
            .unwrap_or_default()
    }

    /// The active sync-checkpoint master key: a persisted override wins over
    /// the compiled-in parameter.
    pub fn checkpoint_master_key(&self) -> Result<PubKey, ConsensusError> {
        let hex_key = self
            .db
            .read_checkpoint_pubkey()?
            .unwrap_or_else(|| self.params.checkpoint_master_key.clone());
        let bytes = hex::decode(hex_key)
            .map_err(|_| ConsensusError::BadSignatureEncoding)?;
        PubKey::from_slice(&bytes).map_err(|_| ConsensusError::BadSignatureEncoding)
    }

    // ------------------------------------------------------------------
    // block intake

    /// Context-free validation: everything checkable without the parent or
    /// any chain state.
    pub fn check_block_structure(&self, block: &Block) -> Result<(), ConsensusError> {
        if block.vtx.is_empty() {
            return Err(ConsensusError::BadProof("empty transaction list"));
        }
        if !block.vtx[0].is_coinbase() {
            return Err(ConsensusError::BadProof("first tx is not a coinbase"));
        }
        if block.vtx.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(ConsensusError::BadProof("multiple coinbases"));
        }
        match block.proof_type() {
            ProofType::Pos => {
                // the coinstake is the second transaction, and the only one
                if block.vtx.iter().skip(2).any(|tx| tx.is_coinstake()) {
                    return Err(ConsensusError::BadProof("misplaced coinstake"));
                }
                if block.signature.is_empty() {
                    return Err(ConsensusError::BadBlockSignature);
                }
            }
            ProofType::QPos => {
                if block.vtx.iter().any(|tx| tx.is_coinstake()) {
                    return Err(ConsensusError::BadProof("coinstake in a qPoS block"));
                }
                if block.signature.is_empty() {
                    return Err(ConsensusError::BadBlockSignature);
                }
            }
            ProofType::Pow => {
                let hash = block.hash(&self.params);
                if !check_proof_of_work(&hash, block.bits) {
                    return Err(ConsensusError::BadProof("hash above target"));
                }
            }
        }
        for tx in &block.vtx {
            for out in &tx.vout {
                if !money_range(out.value) {
                    return Err(ConsensusError::ValueOutOfRange);
                }
            }
        }
        if block.merkle_root != block.build_merkle_root() {
            return Err(ConsensusError::BadMerkleRoot);
        }
        Ok(())
    }

    /// Accept a candidate block: structural checks, contextual checks
    /// against its parent, persistence, and best-chain selection when it
    /// extends the heaviest chain.
    pub fn process_block(
        &mut self,
        block: &Block,
        clock: &dyn Clock,
    ) -> Result<Hash256, ConsensusError> {
        let hash = block.hash(&self.params);
        if self.index.contains(&hash) {
            return Err(ConsensusError::DuplicateBlock(hash));
        }
        self.check_block_structure(block)?;

        let prev = self
            .index
            .lookup(&block.hash_prev)
            .ok_or(ConsensusError::OrphanBlock(block.hash_prev))?;
        let height = self.index.entry(prev).height + 1;
        let fork = self.params.fork_at(height);

        match block.proof_type() {
            ProofType::QPos => {
                if fork < Fork::QPos {
                    return Err(ConsensusError::BadProof("qPoS before activation"));
                }
                if block.height != height {
                    return Err(ConsensusError::BadProof("qPoS header height mismatch"));
                }
            }
            ProofType::Pow => {
                if height > self.params.pow_cutoff_height {
                    return Err(ConsensusError::BadProof("PoW after cutoff"));
                }
            }
            ProofType::Pos => {
                if fork >= Fork::QPos {
                    return Err(ConsensusError::BadProof("PoS after qPoS activation"));
                }
            }
        }

        // ordering and drift
        if (block.time as i64) <= self.index.past_time_limit(prev, &self.params) {
            return Err(ConsensusError::BadTimestamp);
        }
        let now = clock.adjusted_time();
        let drift_bound = if block.is_qpos() {
            now
        } else {
            self.params.future_drift(now)
        };
        if block.time as i64 > drift_bound {
            return Err(ConsensusError::BadTimestamp);
        }

        if !self.params.hardened_checkpoint_ok(height, &hash) {
            return Err(ConsensusError::HardenedCheckpointMismatch(height));
        }
        if !self.check_sync(&hash, prev) {
            return Err(ConsensusError::CheckpointNotDescendant);
        }

        // stage qPoS operations once; replay never re-parses scripts
        let mut qpos_ops = Vec::new();
        for tx in &block.vtx {
            qpos_ops.extend(extract_ops(tx, self.params.network)?);
        }
        if !qpos_ops.is_empty() && fork < Fork::Purchase {
            return Err(ConsensusError::BadProof("qPoS operation before activation"));
        }

        // persist the raw block and index the node
        let block_bytes = block.to_bytes();
        let pos = self.files.append_block(&block_bytes)?;
        let mut entry =
            BlockIndexEntry::from_block(block, hash, pos, height, qpos_ops, &self.params);
        entry.block_size = block_bytes.len() as u32;
        entry.prev = Some(prev);
        let prev_entry = self.index.entry(prev);
        if block.is_qpos() {
            entry.stake_modifier = prev_entry.stake_modifier;
        } else {
            entry.stake_modifier = compute_stake_modifier(prev_entry.stake_modifier, &hash);
            entry.flags |= FLAG_STAKE_MODIFIER;
        }
        entry.modifier_checksum = modifier_checksum(
            prev_entry.modifier_checksum,
            entry.flags,
            entry.stake_modifier,
            &entry.hash_proof_of_stake,
        );
        if !self
            .params
            .modifier_checkpoint_ok(height, entry.modifier_checksum)
        {
            return Err(ConsensusError::BadProof("stake modifier checkpoint"));
        }
        entry.chain_trust = prev_entry.chain_trust.clone() + entry.block_trust();
        let trust = entry.chain_trust.clone();
        let node = self.index.insert(entry);
        let record = self.index.entry(node).to_disk_record(&self.index);
        self.db.write_block_index(&record)?;

        if trust > self.best_trust() {
            self.set_best_chain(node)?;
            self.accept_pending_sync_checkpoint();
        } else {
            info!(height, %hash, "accepted side-chain block");
        }
        Ok(hash)
    }

    // ------------------------------------------------------------------
    // sync checkpoints

    /// Height rule from the sync-checkpoint protocol: a new block must sit
    /// on the checkpoint's chain.
    pub fn check_sync(&self, hash: &Hash256, prev: NodeId) -> bool {
        if self.params.is_testnet() {
            return true;
        }
        let sync = match self.index.lookup(&self.checkpoints.current) {
            Some(node) => node,
            // checkpoint still at genesis before the index has it
            None => return true,
        };
        let sync_height = self.index.entry(sync).height;
        let height = self.index.entry(prev).height + 1;
        if height > sync_height {
            let mut at = prev;
            while self.index.entry(at).height > sync_height {
                match self.index.entry(at).prev {
                    Some(p) => at = p,
                    None => return false,
                }
            }
            return self.index.entry(at).hash == self.checkpoints.current;
        }
        if height == sync_height {
            return *hash == self.checkpoints.current;
        }
        self.index.contains(hash)
    }

    /// Validate a received checkpoint hash against the descendant rule.
    /// Returns false for a stale-but-harmless ancestor checkpoint.
    pub fn validate_sync_checkpoint(&mut self, hash: Hash256) -> Result<bool, ConsensusError> {
        let current = self
            .index
            .lookup(&self.checkpoints.current)
            .ok_or_else(|| ConsensusError::ReplayFailed("sync checkpoint not indexed".into()))?;
        let candidate = self
            .index
            .lookup(&hash)
            .ok_or(ConsensusError::PendingSyncCheckpoint(hash))?;
        let current_height = self.index.entry(current).height;
        let candidate_height = self.index.entry(candidate).height;

        if candidate_height <= current_height {
            // harmless if it is an ancestor of the current checkpoint,
            // conflicting otherwise
            let mut at = current;
            while self.index.entry(at).height > candidate_height {
                match self.index.entry(at).prev {
                    Some(p) => at = p,
                    None => break,
                }
            }
            if self.index.entry(at).hash != hash {
                self.checkpoints.invalid = hash;
                return Err(ConsensusError::CheckpointNotDescendant);
            }
            return Ok(false);
        }

        let mut at = candidate;
        while self.index.entry(at).height > current_height {
            match self.index.entry(at).prev {
                Some(p) => at = p,
                None => break,
            }
        }
        if self.index.entry(at).hash != self.checkpoints.current {
            self.checkpoints.invalid = hash;
            return Err(ConsensusError::CheckpointNotDescendant);
        }
        Ok(true)
    }

    /// Handle a signed checkpoint message. May reorganize to the checkpoint
    /// block.
    pub fn process_sync_checkpoint(
        &mut self,
        message: SyncCheckpoint,
    ) -> Result<(), ConsensusError> {
        let master = self.checkpoint_master_key()?;
        let payload = message.verify(&master)?;
        let hash = payload.hash_checkpoint;

        let node = match self.index.lookup(&hash) {
            Some(node) => node,
            None => {
                // keep it pending until the block arrives
                self.checkpoints.pending = Some(message);
                return Err(ConsensusError::PendingSyncCheckpoint(hash));
            }
        };
        if !self.validate_sync_checkpoint(hash)? {
            return Ok(());
        }
        if !self.index.is_in_main_chain(node, self.best) {
            if let Err(e) = self.set_best_chain(node) {
                self.checkpoints.invalid = hash;
                return Err(e);
            }
        }
        self.db.write_sync_checkpoint(&hash)?;
        self.checkpoints.current = hash;
        self.checkpoints.pending = None;
        info!(%hash, "sync checkpoint accepted");
        Ok(())
    }

    /// Retry a pending checkpoint once its block may have arrived.
    pub fn accept_pending_sync_checkpoint(&mut self) {
        let pending = match &self.checkpoints.pending {
            Some(p) => p.clone(),
            None => return,
        };
        let hash = match pending.hash_checkpoint() {
            Ok(h) => h,
            Err(_) => {
                self.checkpoints.pending = None;
                return;
            }
        };
        if self.index.contains(&hash) {
            if let Err(e) = self.process_sync_checkpoint(pending) {
                warn!(%hash, error = %e, "pending sync checkpoint rejected");
            }
        }
    }
}

/// Process-wide cooperative shutdown request, polled inside long loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The lock around all of consensus plus the process collaborators.
pub struct Consensus {
    pub state: Mutex<ChainState>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: ShutdownFlag,
}

impl Consensus {
    pub fn new(state: ChainState, clock: Arc<dyn Clock>) -> Self {
        Self::with_shutdown(state, clock, ShutdownFlag::new())
    }

    pub fn with_shutdown(state: ChainState, clock: Arc<dyn Clock>, shutdown: ShutdownFlag) -> Self {
        Consensus {
            state: Mutex::new(state),
            clock,
            shutdown,
        }
    }

    pub fn process_block(&self, block: &Block) -> Result<Hash256, ConsensusError> {
        self.state.lock().process_block(block, &*self.clock)
    }

    pub fn process_sync_checkpoint(&self, message: SyncCheckpoint) -> Result<(), ConsensusError> {
        self.state.lock().process_sync_checkpoint(message)
    }

    /// One poll of the sync-registry loop: while replaying, test whether
    /// the registry has caught up with real time and may exit replay.
    pub fn sync_registry_tick(&self) {
        let mut state = self.state.lock();
        if state.registry.is_in_replay_mode() {
            let now = self.clock.adjusted_time();
            let ChainState {
                registry, params, ..
            } = &mut *state;
            registry.check_synced(now, params);
        }
    }

    // ------------------------------------------------------------------
    // read surface for the RPC boundary; each call takes the main lock for
    // the duration of the snapshot

    pub fn tip(&self) -> (i32, Hash256) {
        let state = self.state.lock();
        (state.best_height(), state.best_hash())
    }

    /// Full registry summary (`getqposinfo`-shaped).
    pub fn qpos_info(&self) -> quill_registry::summary::RegistrySummary {
        self.state.lock().registry.summary()
    }

    /// One staker's summary, if it exists.
    pub fn staker_info(&self, id: u32) -> Option<quill_registry::summary::StakerSummary> {
        self.state.lock().registry.staker_summary(id)
    }

    /// The current producer schedule (`getblockschedule`-shaped).
    pub fn block_schedule(&self) -> String {
        self.state.lock().registry.queue().summary_string()
    }

    /// Manually leave replay mode to kickstart production. Testnet only.
    pub fn exit_replay(&self) {
        let mut state = self.state.lock();
        let ChainState {
            registry, params, ..
        } = &mut *state;
        registry.exit_replay_mode(params);
    }
}
