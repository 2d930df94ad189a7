//! The sorted key/value store behind consensus, with an active-batch overlay
//! giving all-or-nothing write grouping. Reads consult the overlay first; a
//! buffered deletion hides the backing value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use thiserror::Error;
use tracing::{debug, info, warn};

use quill_core::{ChainParams, CodecError, Decodable, Encodable, Hash256};
use quill_registry::{QpRegistry, RegistryError, SnapshotSink};

use crate::records::{DiskBlockIndexRecord, TxIndexEntry};

/// Format gate: a mismatch wipes the index directory and forces a rescan of
/// the block files.
pub const DATABASE_VERSION: i32 = 70512;

const KEY_VERSION: &[u8] = b"version";
const KEY_BEST_CHAIN: &[u8] = b"hashBestChain";
const KEY_SYNC_CHECKPOINT: &[u8] = b"hashSyncCheckpoint";
const KEY_CHECKPOINT_PUBKEY: &[u8] = b"checkpointPubKey";
const KEY_BEST_INVALID_TRUST: &[u8] = b"bnBestInvalidTrust";
const KEY_BEST_REGISTRY_HEIGHT: &[u8] = b"bestRegistryHeight";
const PREFIX_TX: &[u8] = b"tx/";
const PREFIX_BLOCK_INDEX: &[u8] = b"blockindex/";
const PREFIX_REGISTRY_SNAPSHOT: &[u8] = b"registrySnapshot/";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("file i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record {key}: {err}")]
    Corrupt { key: String, err: CodecError },
    #[error("database version mismatch: found {found}, need {need}")]
    VersionMismatch { found: i32, need: i32 },
    #[error("registry snapshot height mismatch: want {want}, got {got}")]
    SnapshotHeightMismatch { want: i32, got: i32 },
    #[error("bad block-file magic or framing")]
    BadMagic,
    #[error("attempted to read a null disk position")]
    NullPosition,
}

fn tx_key(txid: &Hash256) -> Vec<u8> {
    let mut key = PREFIX_TX.to_vec();
    key.extend_from_slice(&txid.0);
    key
}

fn block_index_key(hash: &Hash256) -> Vec<u8> {
    let mut key = PREFIX_BLOCK_INDEX.to_vec();
    key.extend_from_slice(&hash.0);
    key
}

// big-endian so sled's lexicographic order is height order
fn snapshot_key(height: i32) -> Vec<u8> {
    let mut key = PREFIX_REGISTRY_SNAPSHOT.to_vec();
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key
}

/// The durable chain database. One active batch at a time; every mutation
/// while a batch is open lands in the overlay and becomes visible to reads
/// immediately, but hits sled only on commit.
pub struct ChainDb {
    db: sled::Db,
    path: PathBuf,
    /// `Some(bytes)` is a pending put, `None` a pending delete.
    batch: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl ChainDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let mut store = ChainDb {
            db,
            path,
            batch: None,
        };
        match store.read_raw::<i32>(KEY_VERSION)? {
            None => {
                store.write_direct(KEY_VERSION, &DATABASE_VERSION)?;
            }
            Some(found) if found != DATABASE_VERSION => {
                return Err(StoreError::VersionMismatch {
                    found,
                    need: DATABASE_VERSION,
                });
            }
            Some(_) => {}
        }
        Ok(store)
    }

    /// Destroy and recreate the index. Used when the version gate fails;
    /// block files are untouched and get rescanned.
    pub fn wipe_and_reopen(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            warn!(?path, "wiping transaction index");
            std::fs::remove_dir_all(path)?;
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // batch control

    pub fn begin_batch(&mut self) -> bool {
        if self.batch.is_some() {
            return false;
        }
        self.batch = Some(BTreeMap::new());
        true
    }

    pub fn batch_is_active(&self) -> bool {
        self.batch.is_some()
    }

    /// Apply every buffered write atomically.
    pub fn commit_batch(&mut self) -> Result<(), StoreError> {
        let overlay = match self.batch.take() {
            Some(o) => o,
            None => return Ok(()),
        };
        let mut batch = sled::Batch::default();
        for (key, value) in overlay {
            match value {
                Some(bytes) => batch.insert(key, bytes),
                None => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn abort_batch(&mut self) {
        self.batch = None;
    }

    // ------------------------------------------------------------------
    // raw typed access

    fn read_raw<T: Decodable>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        if let Some(overlay) = &self.batch {
            if let Some(entry) = overlay.get(key) {
                return match entry {
                    Some(bytes) => Ok(Some(Self::decode_value(key, bytes)?)),
                    // deleted in the batch: the backing value is hidden
                    None => Ok(None),
                };
            }
        }
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(Self::decode_value(key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn decode_value<T: Decodable>(key: &[u8], bytes: &[u8]) -> Result<T, StoreError> {
        T::from_bytes(bytes).map_err(|err| StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            err,
        })
    }

    fn write_raw<T: Encodable>(&mut self, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = value.to_bytes();
        match &mut self.batch {
            Some(overlay) => {
                overlay.insert(key.to_vec(), Some(bytes));
                Ok(())
            }
            None => self.write_direct(key, value),
        }
    }

    fn write_direct<T: Encodable>(&mut self, key: &[u8], value: &T) -> Result<(), StoreError> {
        self.db.insert(key, value.to_bytes())?;
        Ok(())
    }

    fn erase_raw(&mut self, key: &[u8]) -> Result<(), StoreError> {
        match &mut self.batch {
            Some(overlay) => {
                overlay.insert(key.to_vec(), None);
            }
            None => {
                self.db.remove(key)?;
            }
        }
        Ok(())
    }

    /// Present in the batch or on disk. A record deleted in the batch but
    /// still on disk counts as existing; see [`ChainDb::is_viable`].
    pub fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        if let Some(overlay) = &self.batch {
            if let Some(Some(_)) = overlay.get(key) {
                return Ok(true);
            }
        }
        Ok(self.db.contains_key(key)?)
    }

    /// Present and not marked for deletion anywhere.
    pub fn is_viable(&self, key: &[u8]) -> Result<bool, StoreError> {
        if let Some(overlay) = &self.batch {
            if let Some(entry) = overlay.get(key) {
                return Ok(entry.is_some());
            }
        }
        Ok(self.db.contains_key(key)?)
    }

    // ------------------------------------------------------------------
    // transaction index

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, StoreError> {
        self.read_raw(&tx_key(txid))
    }

    pub fn update_tx_index(&mut self, txid: &Hash256, entry: &TxIndexEntry) -> Result<(), StoreError> {
        self.write_raw(&tx_key(txid), entry)
    }

    pub fn erase_tx_index(&mut self, txid: &Hash256) -> Result<(), StoreError> {
        self.erase_raw(&tx_key(txid))
    }

    pub fn contains_tx(&self, txid: &Hash256) -> Result<bool, StoreError> {
        self.is_viable(&tx_key(txid))
    }

    // ------------------------------------------------------------------
    // block index records

    pub fn write_block_index(&mut self, record: &DiskBlockIndexRecord) -> Result<(), StoreError> {
        self.write_raw(&block_index_key(&record.block_hash), record)
    }

    pub fn read_block_index(
        &self,
        hash: &Hash256,
    ) -> Result<Option<DiskBlockIndexRecord>, StoreError> {
        self.read_raw(&block_index_key(hash))
    }

    /// Every persisted block index record, in undefined order.
    pub fn load_block_index_records(&self) -> Result<Vec<DiskBlockIndexRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.db.scan_prefix(PREFIX_BLOCK_INDEX) {
            let (key, bytes) = item?;
            records.push(Self::decode_value(&key, &bytes)?);
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // chain pointers

    pub fn read_best_chain(&self) -> Result<Option<Hash256>, StoreError> {
        self.read_raw(KEY_BEST_CHAIN)
    }

    pub fn write_best_chain(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.write_raw(KEY_BEST_CHAIN, hash)
    }

    pub fn read_sync_checkpoint(&self) -> Result<Option<Hash256>, StoreError> {
        self.read_raw(KEY_SYNC_CHECKPOINT)
    }

    pub fn write_sync_checkpoint(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        self.write_raw(KEY_SYNC_CHECKPOINT, hash)
    }

    pub fn read_checkpoint_pubkey(&self) -> Result<Option<String>, StoreError> {
        self.read_raw(KEY_CHECKPOINT_PUBKEY)
    }

    pub fn write_checkpoint_pubkey(&mut self, key_hex: &str) -> Result<(), StoreError> {
        self.write_raw(KEY_CHECKPOINT_PUBKEY, &key_hex.to_string())
    }

    pub fn read_best_invalid_trust(&self) -> Result<BigUint, StoreError> {
        let bytes: Option<Vec<u8>> = self.read_raw(KEY_BEST_INVALID_TRUST)?;
        Ok(bytes
            .map(|b| BigUint::from_bytes_be(&b))
            .unwrap_or_default())
    }

    pub fn write_best_invalid_trust(&mut self, trust: &BigUint) -> Result<(), StoreError> {
        self.write_raw(KEY_BEST_INVALID_TRUST, &trust.to_bytes_be())
    }

    // ------------------------------------------------------------------
    // registry snapshots

    /// Persist a full registry serialization under its height and advance
    /// the best-height pointer. With `sparse` retention, older snapshots
    /// are thinned as new ones land.
    pub fn write_registry_snapshot(
        &mut self,
        height: i32,
        registry: &QpRegistry,
        params: &ChainParams,
        sparse: bool,
    ) -> Result<(), StoreError> {
        self.write_raw(KEY_BEST_REGISTRY_HEIGHT, &height)?;
        self.write_raw(&snapshot_key(height), registry)?;
        debug!(height, sparse, "registry snapshot written");

        let retain_window = params.recent_snapshots * params.blocks_per_snapshot;
        let cutoff = height - retain_window;
        if cutoff > 0 && cutoff % params.sparse_snapshot_interval != 0 {
            self.erase_raw(&snapshot_key(cutoff))?;
        }
        if sparse {
            // deep replay thins the trail right behind itself
            let prev = height - params.blocks_per_snapshot;
            if prev > 0 && prev % params.sparse_snapshot_interval != 0 {
                self.erase_raw(&snapshot_key(prev))?;
            }
        }
        Ok(())
    }

    pub fn registry_snapshot_is_viable(&self, height: i32) -> Result<bool, StoreError> {
        self.is_viable(&snapshot_key(height))
    }

    pub fn read_registry_snapshot(&self, height: i32) -> Result<Option<QpRegistry>, StoreError> {
        let registry: Option<QpRegistry> = self.read_raw(&snapshot_key(height))?;
        if let Some(registry) = &registry {
            if registry.block_height() != height {
                return Err(StoreError::SnapshotHeightMismatch {
                    want: height,
                    got: registry.block_height(),
                });
            }
        }
        Ok(registry)
    }

    pub fn read_best_registry_snapshot(&self) -> Result<Option<(i32, QpRegistry)>, StoreError> {
        let height: Option<i32> = self.read_raw(KEY_BEST_REGISTRY_HEIGHT)?;
        match height {
            Some(h) => Ok(self.read_registry_snapshot(h)?.map(|r| (h, r))),
            None => Ok(None),
        }
    }

    /// Nearest snapshot at or below `height` — batch overlay included; the
    /// reorg and bootstrap paths restore from here and replay forward.
    pub fn read_snapshot_at_or_below(
        &self,
        height: i32,
    ) -> Result<Option<(i32, QpRegistry)>, StoreError> {
        if height < 0 {
            return Ok(None);
        }
        let upper = snapshot_key(height + 1);
        let mut best: Option<(i32, QpRegistry)> = None;
        for item in self
            .db
            .range(PREFIX_REGISTRY_SNAPSHOT.to_vec()..upper.clone())
            .rev()
        {
            let (key, bytes) = item?;
            if let Some(overlay) = &self.batch {
                // a pending delete hides the backing snapshot
                if matches!(overlay.get(key.as_ref()), Some(None)) {
                    continue;
                }
            }
            let registry: QpRegistry = Self::decode_value(&key, &bytes)?;
            best = Some((registry.block_height(), registry));
            break;
        }
        if let Some(overlay) = &self.batch {
            for (key, value) in overlay.range(PREFIX_REGISTRY_SNAPSHOT.to_vec()..upper) {
                if let Some(bytes) = value {
                    let registry: QpRegistry = Self::decode_value(key, bytes)?;
                    let h = registry.block_height();
                    if best.as_ref().map(|(b, _)| h > *b).unwrap_or(true) {
                        best = Some((h, registry));
                    }
                }
            }
        }
        Ok(best)
    }

    pub fn erase_registry_snapshot(&mut self, height: i32) -> Result<(), StoreError> {
        self.erase_raw(&snapshot_key(height))
    }

    pub fn snapshot_heights(&self) -> Result<Vec<i32>, StoreError> {
        let mut heights = Vec::new();
        for item in self.db.scan_prefix(PREFIX_REGISTRY_SNAPSHOT) {
            let (key, _) = item?;
            let tail = &key[PREFIX_REGISTRY_SNAPSHOT.len()..];
            if tail.len() == 4 {
                heights.push(u32::from_be_bytes(tail.try_into().unwrap()) as i32);
            }
        }
        Ok(heights)
    }
}

/// Registry advances write boundary snapshots straight through the store.
pub struct SnapshotWriter<'a> {
    pub db: &'a mut ChainDb,
    pub params: &'a ChainParams,
}

impl SnapshotSink for SnapshotWriter<'_> {
    fn write_registry_snapshot(
        &mut self,
        height: i32,
        registry: &QpRegistry,
        sparse: bool,
    ) -> Result<(), RegistryError> {
        self.db
            .write_registry_snapshot(height, registry, self.params, sparse)
            .map_err(|e| RegistryError::SnapshotWrite(e.to_string()))
    }
}

impl Drop for ChainDb {
    fn drop(&mut self) {
        if self.batch.is_some() {
            info!("dropping chain db with an uncommitted batch; discarding");
        }
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_registry::{BlockInfo, NullSnapshotSink, SnapshotType};

    fn open_temp() -> (tempfile::TempDir, ChainDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path().join("txindex")).unwrap();
        (dir, db)
    }

    /// Walk the registry's synchronized block forward; heights stay below
    /// the purchase fork so no schedule state is involved.
    fn registry_at(height: i32, params: &ChainParams) -> QpRegistry {
        let mut registry = QpRegistry::new(params.genesis_hash());
        let block = BlockInfo {
            height,
            hash: Hash256([height as u8; 32]),
            time: 0,
            money_supply: 0,
            staker_id: 0,
        };
        registry
            .update_on_new_block(
                &block,
                &block,
                &[],
                SnapshotType::None,
                &mut NullSnapshotSink,
                params,
            )
            .unwrap();
        registry
    }

    #[test]
    fn batch_reads_see_uncommitted_writes() {
        let (_dir, mut db) = open_temp();
        let hash = Hash256([7; 32]);
        assert!(db.begin_batch());
        db.write_best_chain(&hash).unwrap();
        assert_eq!(db.read_best_chain().unwrap(), Some(hash));
        db.abort_batch();
        assert_eq!(db.read_best_chain().unwrap(), None);

        db.begin_batch();
        db.write_best_chain(&hash).unwrap();
        db.commit_batch().unwrap();
        assert_eq!(db.read_best_chain().unwrap(), Some(hash));
    }

    #[test]
    fn batched_delete_hides_backing_value() {
        let (_dir, mut db) = open_temp();
        let txid = Hash256([1; 32]);
        let entry = TxIndexEntry::new(crate::TxDiskPos::null(), 3, 0, 2);
        db.update_tx_index(&txid, &entry).unwrap();

        db.begin_batch();
        db.erase_tx_index(&txid).unwrap();
        assert_eq!(db.read_tx_index(&txid).unwrap(), None);
        // `exists` keeps the original quirk: the backing record still counts
        assert!(db.exists(&tx_key(&txid)).unwrap());
        assert!(!db.is_viable(&tx_key(&txid)).unwrap());
        assert!(!db.contains_tx(&txid).unwrap());
        db.abort_batch();
        assert!(db.contains_tx(&txid).unwrap());
    }

    #[test]
    fn version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txindex");
        {
            let mut db = ChainDb::open(&path).unwrap();
            db.write_direct(KEY_VERSION, &1).unwrap();
        }
        assert!(matches!(
            ChainDb::open(&path),
            Err(StoreError::VersionMismatch { found: 1, .. })
        ));
        let db = ChainDb::wipe_and_reopen(&path).unwrap();
        assert_eq!(db.read_best_chain().unwrap(), None);
    }

    #[test]
    fn snapshot_write_read_and_thin() {
        let (_dir, mut db) = open_temp();
        let params = ChainParams::testnet();
        for h in [24, 48, 72] {
            let snap = registry_at(h, &params);
            db.write_registry_snapshot(h, &snap, &params, false).unwrap();
        }
        let (best, _) = db.read_best_registry_snapshot().unwrap().unwrap();
        assert_eq!(best, 72);
        let (h, _) = db.read_snapshot_at_or_below(60).unwrap().unwrap();
        assert_eq!(h, 48);
        assert!(db.read_snapshot_at_or_below(10).unwrap().is_none());

        // a snapshot stored under the wrong height is corruption
        let wrong = registry_at(24, &params);
        db.write_registry_snapshot(96, &wrong, &params, false).unwrap();
        assert!(matches!(
            db.read_registry_snapshot(96),
            Err(StoreError::SnapshotHeightMismatch { want: 96, got: 24 })
        ));
    }

    #[test]
    fn snapshot_lookup_sees_active_batch() {
        let (_dir, mut db) = open_temp();
        let params = ChainParams::testnet();
        let committed = registry_at(24, &params);
        db.write_registry_snapshot(24, &committed, &params, false).unwrap();

        db.begin_batch();
        let pending = registry_at(48, &params);
        db.write_registry_snapshot(48, &pending, &params, false).unwrap();
        let (h, _) = db.read_snapshot_at_or_below(100).unwrap().unwrap();
        assert_eq!(h, 48);
        db.erase_registry_snapshot(24).unwrap();
        assert!(db.read_snapshot_at_or_below(40).unwrap().is_none());
        db.abort_batch();
        let (h, _) = db.read_snapshot_at_or_below(100).unwrap().unwrap();
        assert_eq!(h, 24);
    }

    #[test]
    fn snapshot_retention_prunes_old_heights() {
        let (_dir, mut db) = open_temp();
        let mut params = ChainParams::testnet();
        params.recent_snapshots = 2;
        params.blocks_per_snapshot = 24;
        params.sparse_snapshot_interval = 96;
        for h in (24..=240).step_by(24) {
            let snap = registry_at(h, &params);
            db.write_registry_snapshot(h, &snap, &params, false).unwrap();
        }
        let mut heights = db.snapshot_heights().unwrap();
        heights.sort_unstable();
        // inside the recent window everything survives; behind it only
        // multiples of the sparse interval remain
        assert!(heights.contains(&240));
        assert!(heights.contains(&216));
        assert!(heights.contains(&96));
        assert!(heights.contains(&192));
        assert!(!heights.contains(&24));
        assert!(!heights.contains(&48));
        assert!(!heights.contains(&120));
    }
}
