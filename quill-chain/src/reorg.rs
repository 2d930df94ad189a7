//! Best-chain selection. Extending the tip is the fast path; switching to a
//! non-descendant walks back to the common ancestor, disconnects, restores
//! the registry from the nearest snapshot, and connects forward. The whole
//! transition commits atomically or not at all.

use tracing::{info, warn};

use quill_registry::{QpRegistry, SnapshotType};

use crate::error::ConsensusError;
use crate::index::NodeId;
use crate::state::ChainState;

impl ChainState {
    /// Rebuild a registry synchronized with main-chain node `target`:
    /// nearest snapshot at or below it, then replay block-by-block. The
    /// result is bit-identical to a replay from genesis.
    pub fn rewind_registry(&self, target: NodeId) -> Result<QpRegistry, ConsensusError> {
        let target_height = self.index.entry(target).height;
        let target_hash = self.index.entry(target).hash;

        let mut registry = QpRegistry::new(self.params.genesis_hash());
        let mut from_height = 0;
        if let Some((height, snapshot)) = self.db.read_snapshot_at_or_below(target_height)? {
            let on_main_chain = self
                .index
                .at_height(height)
                .map(|node| self.index.entry(node).hash == snapshot.block_hash())
                .unwrap_or(false);
            if on_main_chain {
                from_height = height;
                registry = snapshot;
            } else {
                warn!(height, "snapshot off the main chain; replaying from genesis");
            }
        }

        for height in (from_height + 1)..=target_height {
            let node = self.index.at_height(height).ok_or_else(|| {
                ConsensusError::ReplayFailed(format!("no main-chain node at height {height}"))
            })?;
            let prev = self.index.entry(node).prev.ok_or_else(|| {
                ConsensusError::ReplayFailed(format!("missing parent at height {height}"))
            })?;
            let info = self.index.entry(node).block_info();
            let prev_info = self.index.entry(prev).block_info();
            let ops = self.index.entry(node).qpos_ops.clone();
            // SnapshotType::All with a null sink: the last-snapshot marker
            // advances exactly as it did originally, but nothing persists
            registry.update_on_new_block(
                &info,
                &prev_info,
                &ops,
                SnapshotType::All,
                &mut quill_registry::NullSnapshotSink,
                &self.params,
            )?;
        }

        if registry.block_hash() != target_hash {
            return Err(ConsensusError::ReplayFailed(format!(
                "registry replay landed on {} instead of {}",
                registry.block_hash(),
                target_hash
            )));
        }
        Ok(registry)
    }

    /// Make `new_tip` the best chain. Callers have already established that
    /// its cumulative trust exceeds the current best's.
    pub fn set_best_chain(&mut self, new_tip: NodeId) -> Result<(), ConsensusError> {
        self.db.begin_batch();
        match self.set_best_chain_inner(new_tip) {
            Ok(()) => {
                self.db.commit_batch()?;
                Ok(())
            }
            Err(e) => {
                self.db.abort_batch();
                let trust = self.index.entry(new_tip).chain_trust.clone();
                if trust > self.best_invalid_trust {
                    warn!(
                        hash = %self.index.entry(new_tip).hash,
                        "invalid chain carries more trust than the best chain"
                    );
                    self.best_invalid_trust = trust.clone();
                    let _ = self.db.write_best_invalid_trust(&trust);
                }
                Err(e)
            }
        }
    }

    fn set_best_chain_inner(&mut self, new_tip: NodeId) -> Result<(), ConsensusError> {
        let old_best = match self.best {
            Some(best) => best,
            None => {
                return Err(ConsensusError::ReplayFailed(
                    "best chain not initialized".into(),
                ))
            }
        };
        if new_tip == old_best {
            return Ok(());
        }
        let ancestor = self
            .index
            .common_ancestor(old_best, new_tip)
            .ok_or_else(|| ConsensusError::ReplayFailed("disjoint block trees".into()))?;
        let disconnect_path = self.index.path_down(ancestor, old_best);
        let connect_path = self.index.path_down(ancestor, new_tip);

        if !disconnect_path.is_empty() {
            info!(
                fork_height = self.index.entry(ancestor).height,
                disconnect = disconnect_path.len(),
                connect = connect_path.len(),
                "reorganizing"
            );
        }

        // undo the old branch, newest block first
        for &node in disconnect_path.iter().rev() {
            let block = self.read_block(node)?;
            self.disconnect_block(&block, node)?;
        }

        // registry state at the fork point
        let mut registry = if disconnect_path.is_empty() {
            self.registry.clone()
        } else {
            self.rewind_registry(ancestor)?
        };

        for &node in &connect_path {
            let block = self.read_block(node)?;
            self.connect_block(&block, node, &mut registry, SnapshotType::All)?;
        }

        self.db.write_best_chain(&self.index.entry(new_tip).hash)?;

        // forward pointers and the height lookup follow the new chain
        for &node in &disconnect_path {
            let height = self.index.entry(node).height;
            self.index.entry_mut(node).next = None;
            self.index.set_main_chain_at(height, None);
        }
        self.index.entry_mut(ancestor).next = None;
        let mut prev = ancestor;
        for &node in &connect_path {
            self.index.entry_mut(prev).next = Some(node);
            let height = self.index.entry(node).height;
            self.index.set_main_chain_at(height, Some(node));
            prev = node;
        }
        self.index.entry_mut(new_tip).next = None;

        for &node in disconnect_path
            .iter()
            .chain(connect_path.iter())
            .chain(std::iter::once(&ancestor))
        {
            let record = self.index.entry(node).to_disk_record(&self.index);
            self.db.write_block_index(&record)?;
        }

        self.best = Some(new_tip);
        self.registry = registry;
        info!(
            height = self.index.entry(new_tip).height,
            hash = %self.index.entry(new_tip).hash,
            "new best chain"
        );
        Ok(())
    }
}
