//! Startup: load every persisted block index record, rebuild the in-memory
//! tree and trust totals, replay the registry from the best snapshot, and
//! re-verify the recent chain at the configured check level. Any failure
//! forks back to the last sound block.

use std::collections::HashSet;

use num_bigint::BigUint;
use tracing::{info, warn};

use quill_core::{Decodable, Encodable, Fork, Hash256};
use quill_registry::{QpRegistry, SnapshotType};
use quill_storage::{BlockFilePos, SnapshotWriter, TxDiskPos, TxIndexEntry};

use crate::clock::Clock;
use crate::error::ConsensusError;
use crate::index::{BlockIndexEntry, NodeId};
use crate::modifier::modifier_checksum;
use crate::state::{ChainState, ShutdownFlag};

/// Verification depth used when the operator does not override it.
pub const DEFAULT_CHECK_LEVEL: u32 = 1;
pub const DEFAULT_CHECK_BLOCKS: i32 = 2500;

impl ChainState {
    /// Create and connect the genesis block. `existing_pos` is given when
    /// the block files already hold genesis (index rebuild after a wipe).
    pub fn init_genesis(
        &mut self,
        existing_pos: Option<BlockFilePos>,
    ) -> Result<NodeId, ConsensusError> {
        let block = self.params.genesis_block();
        let hash = block.hash(&self.params);
        let pos = match existing_pos {
            Some(pos) => pos,
            None => self.files.append_block(&block.to_bytes())?,
        };
        let mut entry = BlockIndexEntry::from_block(&block, hash, pos, 0, Vec::new(), &self.params);
        entry.mint = self.params.initial_supply;
        entry.money_supply = self.params.initial_supply;
        entry.chain_trust = BigUint::from(1u8);
        entry.modifier_checksum = modifier_checksum(0, entry.flags, 0, &Hash256::ZERO);
        let node = self.index.insert(entry);
        self.index.set_main_chain_at(0, Some(node));
        self.best = Some(node);

        self.db.begin_batch();
        let record = self.index.entry(node).to_disk_record(&self.index);
        self.db.write_block_index(&record)?;
        let coinbase = &block.vtx[0];
        self.db.update_tx_index(
            &coinbase.txid(),
            &TxIndexEntry::new(TxDiskPos::new(pos, 0), 0, block.time, coinbase.vout.len()),
        )?;
        self.db.write_best_chain(&hash)?;
        self.db.write_sync_checkpoint(&hash)?;
        self.db.commit_batch()?;

        self.registry = QpRegistry::new(hash);
        self.checkpoints.current = hash;
        info!(%hash, "initialized genesis");
        Ok(node)
    }

    /// Full startup load. Returns the best height reached.
    pub fn load_block_index(
        &mut self,
        clock: &dyn Clock,
        shutdown: &ShutdownFlag,
        check_level: u32,
        check_blocks: i32,
    ) -> Result<i32, ConsensusError> {
        let records = self.db.load_block_index_records()?;
        if records.is_empty() {
            // an empty index over non-empty block files means the database
            // was wiped; rebuild it by rescanning
            if self.files.scan_file(0)?.is_empty() {
                self.init_genesis(None)?;
            } else {
                info!("empty index with existing block files; rescanning");
                self.rescan_block_files(clock)?;
            }
            return Ok(self.best_height());
        }

        // two passes: insert every node, then resolve parent links
        let mut prev_hashes: Vec<Hash256> = Vec::with_capacity(records.len());
        for record in records {
            prev_hashes.push(record.hash_prev);
            let entry = BlockIndexEntry::from_disk_record(record);
            self.index.insert(entry);
        }
        for id in 0..self.index.len() {
            let prev_hash = prev_hashes[id];
            if !prev_hash.is_zero() {
                let prev = self.index.lookup(&prev_hash).ok_or_else(|| {
                    ConsensusError::ReplayFailed(format!(
                        "block index references unknown parent {prev_hash}"
                    ))
                })?;
                self.index.entry_mut(id).prev = Some(prev);
            }
        }

        let best_hash = self
            .db
            .read_best_chain()?
            .ok_or_else(|| ConsensusError::ReplayFailed("hashBestChain not loaded".into()))?;
        let best = self.index.lookup(&best_hash).ok_or_else(|| {
            ConsensusError::ReplayFailed("best chain hash missing from index".into())
        })?;

        // main-chain forward links and the height lookup
        let mut at = best;
        loop {
            self.index
                .set_main_chain_at(self.index.entry(at).height, Some(at));
            match self.index.entry(at).prev {
                Some(prev) => {
                    self.index.entry_mut(prev).next = Some(at);
                    at = prev;
                }
                None => break,
            }
        }

        // cumulative trust and the stake-modifier checksum chain, in height
        // order so parents come first
        let mut by_height: Vec<(i32, NodeId)> = self
            .index
            .iter()
            .map(|(id, e)| (e.height, id))
            .collect();
        by_height.sort_unstable();
        for &(height, id) in &by_height {
            if shutdown.is_requested() {
                return Ok(self.best_height());
            }
            let (prev_trust, prev_checksum) = match self.index.entry(id).prev {
                Some(prev) => (
                    self.index.entry(prev).chain_trust.clone(),
                    self.index.entry(prev).modifier_checksum,
                ),
                None => (BigUint::default(), 0),
            };
            let entry = self.index.entry_mut(id);
            entry.chain_trust = prev_trust + entry.block_trust();
            entry.modifier_checksum = modifier_checksum(
                prev_checksum,
                entry.flags,
                entry.stake_modifier,
                &entry.hash_proof_of_stake,
            );
            if self.params.fork_at(height) < Fork::QPos
                && !self
                    .params
                    .modifier_checkpoint_ok(height, self.index.entry(id).modifier_checksum)
            {
                return Err(ConsensusError::ReplayFailed(format!(
                    "stake modifier checkpoint failed at height {height}"
                )));
            }
        }
        self.best = Some(best);

        // registry replay from the best usable snapshot
        info!(height = self.best_height(), "replaying qPoS registry");
        match self.replay_registry_to_best(shutdown) {
            Ok(registry) => self.registry = registry,
            Err((failed_height, e)) => {
                warn!(failed_height, error = %e, "registry replay failed; forking back");
                let fork = self.index.at_height(failed_height - 1).ok_or(e)?;
                self.set_best_chain(fork)?;
            }
        }

        // checkpoint bookkeeping
        match self.db.read_sync_checkpoint()? {
            Some(hash) => self.checkpoints.current = hash,
            None => {
                let genesis = self.params.genesis_hash();
                self.db.write_sync_checkpoint(&genesis)?;
                self.checkpoints.current = genesis;
            }
        }
        self.best_invalid_trust = self.db.read_best_invalid_trust()?;

        self.verify_chain(shutdown, check_level, check_blocks)?;

        info!(
            height = self.best_height(),
            hash = %self.best_hash(),
            "block index loaded"
        );
        Ok(self.best_height())
    }

    /// Replay the registry along the main chain up to the best block.
    /// On failure, reports the height that refused to connect.
    fn replay_registry_to_best(
        &mut self,
        shutdown: &ShutdownFlag,
    ) -> Result<QpRegistry, (i32, ConsensusError)> {
        let best_height = self.best_height();
        let mut registry = QpRegistry::new(self.params.genesis_hash());
        let mut from_height = 0;
        match self.db.read_snapshot_at_or_below(best_height) {
            Ok(Some((height, snapshot))) => {
                let on_main = self
                    .index
                    .at_height(height)
                    .map(|n| self.index.entry(n).hash == snapshot.block_hash())
                    .unwrap_or(false);
                if on_main {
                    from_height = height;
                    registry = snapshot;
                    info!(height, "restored registry snapshot");
                }
            }
            Ok(None) => {}
            Err(e) => return Err((0, e.into())),
        }

        let recent_window = self.params.recent_snapshots * self.params.blocks_per_snapshot;
        for height in (from_height + 1)..=best_height {
            if shutdown.is_requested() {
                break;
            }
            let node = match self.index.at_height(height) {
                Some(n) => n,
                None => {
                    return Err((
                        height,
                        ConsensusError::ReplayFailed(format!(
                            "no main-chain node at height {height}"
                        )),
                    ))
                }
            };
            let prev = match self.index.entry(node).prev {
                Some(p) => p,
                None => {
                    return Err((
                        height,
                        ConsensusError::ReplayFailed("missing parent during replay".into()),
                    ))
                }
            };
            let info = self.index.entry(node).block_info();
            let prev_info = self.index.entry(prev).block_info();
            let ops = self.index.entry(node).qpos_ops.clone();
            let snap_type = if best_height - height > recent_window {
                SnapshotType::Sparse
            } else {
                SnapshotType::All
            };
            let ChainState { db, params, .. } = self;
            let params: &quill_core::ChainParams = params;
            let mut sink = SnapshotWriter { db, params };
            if let Err(e) =
                registry.update_on_new_block(&info, &prev_info, &ops, snap_type, &mut sink, params)
            {
                return Err((height, e.into()));
            }
        }
        Ok(registry)
    }

    /// Checklevel-dependent re-verification of the recent main chain.
    /// Level 1 re-validates blocks; levels 2..6 cross-check the transaction
    /// index, spent vectors and spenders. The first bad height's parent
    /// becomes the new best chain.
    pub fn verify_chain(
        &mut self,
        shutdown: &ShutdownFlag,
        check_level: u32,
        check_blocks: i32,
    ) -> Result<(), ConsensusError> {
        let best_height = self.best_height();
        if best_height <= 1 || check_level == 0 {
            return Ok(());
        }
        // zero means everything but genesis
        let check_blocks = if check_blocks == 0 {
            i32::MAX
        } else {
            check_blocks
        };
        let depth = check_blocks.min(best_height - 1).max(1);
        let start_height = best_height - depth + 1;
        info!(depth, check_level, "verifying recent blocks");

        // every main-chain block position, for the spent-inside-main-chain
        // check
        let main_positions: HashSet<BlockFilePos> = (0..=best_height)
            .filter_map(|h| self.index.at_height(h))
            .map(|n| self.index.entry(n).pos)
            .collect();

        let mut fork_height: Option<i32> = None;
        'heights: for height in start_height..=best_height {
            if shutdown.is_requested() {
                break;
            }
            let node = match self.index.at_height(height) {
                Some(n) => n,
                None => {
                    fork_height = Some(height);
                    break;
                }
            };
            let block = match self.read_block(node) {
                Ok(b) => b,
                Err(_) => {
                    fork_height = Some(height);
                    break;
                }
            };

            if self.check_block_structure(&block).is_err() {
                fork_height = Some(height);
                break;
            }
            if check_level < 2 {
                continue;
            }
            let block_pos = self.index.entry(node).pos;
            for (n_tx, tx) in block.vtx.iter().enumerate() {
                let txid = tx.txid();
                let entry = match self.db.read_tx_index(&txid)? {
                    Some(e) => e,
                    None => {
                        fork_height = Some(height);
                        break 'heights;
                    }
                };
                if entry.pos.block_pos != block_pos || entry.pos.n_tx != n_tx as u32 {
                    fork_height = Some(height);
                    break 'heights;
                }
                if check_level > 2 {
                    // the position must read back to the same transaction
                    match self.read_tx(&entry.pos) {
                        Ok(found) if found.txid() == txid => {}
                        _ => {
                            fork_height = Some(height);
                            break 'heights;
                        }
                    }
                }
                if check_level > 3 {
                    for spent in entry.spent.iter().filter(|s| !s.is_null()) {
                        if !main_positions.contains(&spent.block_pos) {
                            fork_height = Some(height);
                            break 'heights;
                        }
                        if check_level > 5 {
                            let spender = match self.read_tx(spent) {
                                Ok(t) => t,
                                Err(_) => {
                                    fork_height = Some(height);
                                    break 'heights;
                                }
                            };
                            let spends_it = spender
                                .vin
                                .iter()
                                .any(|input| input.prevout.hash == txid);
                            if !spends_it {
                                fork_height = Some(height);
                                break 'heights;
                            }
                        }
                    }
                }
                if check_level > 4 && !tx.is_coinbase() {
                    for input in &tx.vin {
                        let prev = self.db.read_tx_index(&input.prevout.hash)?;
                        let marked = prev
                            .map(|p| p.output_is_spent(input.prevout.n))
                            .unwrap_or(false);
                        if !marked {
                            fork_height = Some(height);
                            break 'heights;
                        }
                    }
                }
            }
        }

        if let Some(height) = fork_height {
            if shutdown.is_requested() {
                return Ok(());
            }
            warn!(height, "verification failed; moving best chain back");
            let fork = self.index.at_height(height - 1).ok_or_else(|| {
                ConsensusError::ReplayFailed("no parent for bad block".into())
            })?;
            self.set_best_chain(fork)?;
        }
        Ok(())
    }

    /// Rebuild the whole index from the block files, e.g. after a database
    /// version wipe. Blocks re-enter through normal processing.
    pub fn rescan_block_files(&mut self, clock: &dyn Clock) -> Result<(), ConsensusError> {
        let genesis_hash = self.params.genesis_hash();
        let mut initialized = false;
        for file in 0..self.files.file_count() {
            for (pos, bytes) in self.files.scan_file(file)? {
                let block = match quill_core::Block::from_bytes(&bytes) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(file, offset = pos.offset, error = %e, "skipping bad block record");
                        continue;
                    }
                };
                let hash = block.hash(&self.params);
                if hash == genesis_hash && !initialized {
                    self.init_genesis(Some(pos))?;
                    initialized = true;
                    continue;
                }
                match self.process_block(&block, clock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == crate::error::ErrorKind::Transient => {
                        warn!(%hash, error = %e, "deferred block during rescan");
                    }
                    Err(e) => {
                        warn!(%hash, error = %e, "rejected block during rescan");
                    }
                }
            }
        }
        Ok(())
    }
}
