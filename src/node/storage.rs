//! Persistent storage for finalized blocks.
//!
//! Provides a `Storage` trait and a sled-backed implementation. Only
//! finalized blocks are ever written: each write stores the block, its
//! certificate and the resulting state root together, so a crash leaves
//! either the whole height on disk or none of it. State is rebuilt on
//! startup by replaying the stored blocks from genesis.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::consensus::approval::Certificate;
use crate::consensus::block::Block;
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

/// Everything persisted for one finalized height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedRecord {
    pub block: Block,
    pub certificate: Certificate,
    /// Account ledger root after applying `block`.
    pub state_root: Hash,
}

impl FinalizedRecord {
    pub fn height(&self) -> u64 {
        self.block.header.height
    }
}

/// Trait for persistent storage backends.
pub trait Storage: Send + Sync {
    /// Persist a finalized height. Either every part is written or none is.
    fn put_finalized(&self, record: &FinalizedRecord) -> Result<(), StorageError>;
    fn get_record(&self, height: u64) -> Result<Option<FinalizedRecord>, StorageError>;
    fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.get_record(height)?.map(|r| r.block))
    }
    fn get_state_root(&self, height: u64) -> Result<Option<Hash>, StorageError>;
    /// Highest persisted height, `None` when nothing past genesis is stored.
    fn get_latest_height(&self) -> Result<Option<u64>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

const LATEST_KEY: &[u8] = b"latest_height";

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
    state_roots: sled::Tree,
    meta: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let blocks = db
            .open_tree("blocks")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let state_roots = db
            .open_tree("state_roots")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage {
            db,
            blocks,
            state_roots,
            meta,
        })
    }
}

impl Storage for SledStorage {
    fn put_finalized(&self, record: &FinalizedRecord) -> Result<(), StorageError> {
        use sled::Transactional;

        let key = record.height().to_be_bytes();
        let value =
            crate::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result: sled::transaction::TransactionResult<(), ()> =
            (&self.blocks, &self.state_roots, &self.meta).transaction(|(blocks, roots, meta)| {
                blocks.insert(&key[..], value.as_slice())?;
                roots.insert(&key[..], &record.state_root[..])?;
                meta.insert(LATEST_KEY, &key[..])?;
                Ok(())
            });
        result.map_err(|e| StorageError::Io(format!("{:?}", e)))?;
        self.flush()
    }

    fn get_record(&self, height: u64) -> Result<Option<FinalizedRecord>, StorageError> {
        match self
            .blocks
            .get(height.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let record: FinalizedRecord = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                if record.height() != height {
                    return Err(StorageError::Corrupt(format!(
                        "record under key {} has height {}",
                        height,
                        record.height()
                    )));
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn get_state_root(&self, height: u64) -> Result<Option<Hash>, StorageError> {
        match self
            .state_roots
            .get(height.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let root: Hash = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("state root is not 32 bytes".into()))?;
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    fn get_latest_height(&self) -> Result<Option<u64>, StorageError> {
        match self
            .meta
            .get(LATEST_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("latest height is not 8 bytes".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<u64, FinalizedRecord>,
    fail_writes: bool,
}

/// In-memory storage for tests and the simulator.
///
/// Clones share the same records, so a "restarted" node can be pointed at
/// the storage its predecessor wrote.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating a full or broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.write() {
            inner.fail_writes = fail;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn put_finalized(&self, record: &FinalizedRecord) -> Result<(), StorageError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StorageError::Io("lock poisoned".into()))?;
        if inner.fail_writes {
            return Err(StorageError::Io("write failure injected".into()));
        }
        inner.records.insert(record.height(), record.clone());
        Ok(())
    }

    fn get_record(&self, height: u64) -> Result<Option<FinalizedRecord>, StorageError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StorageError::Io("lock poisoned".into()))?;
        Ok(inner.records.get(&height).cloned())
    }

    fn get_state_root(&self, height: u64) -> Result<Option<Hash>, StorageError> {
        Ok(self.get_record(height)?.map(|r| r.state_root))
    }

    fn get_latest_height(&self) -> Result<Option<u64>, StorageError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StorageError::Io("lock poisoned".into()))?;
        Ok(inner.records.keys().next_back().copied())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::BlockHash;
    use crate::consensus::committee::Committee;
    use crate::state::ChainState;

    fn record(height: u64) -> FinalizedRecord {
        let mut block = Block::genesis(1_000, &ChainState::new(), Committee::default());
        block.header.height = height;
        block.header_hash = block.header.compute_hash();
        FinalizedRecord {
            certificate: Certificate {
                block_hash: block.header_hash,
                height,
                round: 0,
                approvals: Vec::new(),
            },
            block,
            state_root: [height as u8; 32],
        }
    }

    fn roundtrip(storage: &dyn Storage) {
        assert_eq!(storage.get_latest_height().unwrap(), None);
        assert!(storage.get_record(1).unwrap().is_none());

        storage.put_finalized(&record(1)).unwrap();
        storage.put_finalized(&record(2)).unwrap();

        assert_eq!(storage.get_latest_height().unwrap(), Some(2));
        assert_eq!(storage.get_record(1).unwrap(), Some(record(1)));
        assert_eq!(storage.get_state_root(2).unwrap(), Some([2; 32]));
        let block = storage.get_block(2).unwrap().unwrap();
        assert_eq!(block.height(), 2);
        assert_ne!(block.hash(), BlockHash::default());
    }

    #[test]
    fn sled_roundtrip() {
        roundtrip(&SledStorage::open_temporary().unwrap());
    }

    #[test]
    fn memory_roundtrip() {
        roundtrip(&MemoryStorage::new());
    }

    #[test]
    fn sled_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage.put_finalized(&record(1)).unwrap();
        }
        let storage = SledStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get_latest_height().unwrap(), Some(1));
        assert_eq!(storage.get_state_root(1).unwrap(), Some([1; 32]));
    }

    #[test]
    fn injected_failure_writes_nothing() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        assert!(matches!(
            storage.put_finalized(&record(1)),
            Err(StorageError::Io(_))
        ));
        assert!(storage.is_empty());
        assert_eq!(storage.get_latest_height().unwrap(), None);

        storage.set_fail_writes(false);
        storage.put_finalized(&record(1)).unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn clones_share_records() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.put_finalized(&record(1)).unwrap();
        assert_eq!(b.get_latest_height().unwrap(), Some(1));
    }
}
