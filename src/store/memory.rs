use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{BlockStore, CursorId, Direction, StoreHandle, StoreTxn, TxnMode};

/// Reference store keeping every file's records in memory.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<String, Arc<FileRecords>>>,
}

#[derive(Default)]
struct FileRecords {
    records: RwLock<BTreeMap<i64, Vec<u8>>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of one record, bypassing transactions.
    pub fn committed(&self, name: &str, key: i64) -> Option<Vec<u8>> {
        let files = self.files.lock();
        let file = files.get(name)?;
        let records = file.records.read();
        records.get(&key).cloned()
    }

    pub fn record_count(&self, name: &str) -> usize {
        self.files
            .lock()
            .get(name)
            .map_or(0, |file| file.records.read().len())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    type Handle = MemoryHandle;

    async fn open(&self, name: &str) -> Result<MemoryHandle> {
        let records = Arc::clone(self.files.lock().entry(name.to_owned()).or_default());
        Ok(MemoryHandle { records })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.files.lock().remove(name).is_some() {
            debug!(name = %name, "memory store file deleted");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryHandle {
    records: Arc<FileRecords>,
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    type Txn = MemoryTxn;

    async fn begin(&self, mode: TxnMode) -> Result<MemoryTxn> {
        let writer = match mode {
            TxnMode::ReadOnly => None,
            TxnMode::ReadWrite => Some(Arc::clone(&self.records.writer).lock_owned().await),
        };
        Ok(MemoryTxn {
            mode,
            records: Arc::clone(&self.records),
            pending: BTreeMap::new(),
            cursors: Vec::new(),
            _writer: writer,
        })
    }
}

struct MemoryCursor {
    next: Option<i64>,
    direction: Direction,
}

pub struct MemoryTxn {
    mode: TxnMode,
    records: Arc<FileRecords>,
    pending: BTreeMap<i64, Vec<u8>>,
    cursors: Vec<Option<MemoryCursor>>,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryTxn {
    /// First record at or past `bound` in `direction`, own writes first.
    fn seek(&self, bound: i64, direction: Direction) -> Option<(i64, Vec<u8>)> {
        let committed = self.records.records.read();
        let (stored, own) = match direction {
            Direction::Forward => (
                committed.range(bound..).next(),
                self.pending.range(bound..).next(),
            ),
            Direction::Backward => (
                committed.range(..=bound).next_back(),
                self.pending.range(..=bound).next_back(),
            ),
        };
        let pick = match (stored, own) {
            (Some(stored), Some(own)) => {
                let own_wins = match direction {
                    Direction::Forward => own.0 <= stored.0,
                    Direction::Backward => own.0 >= stored.0,
                };
                if own_wins {
                    own
                } else {
                    stored
                }
            }
            (Some(stored), None) => stored,
            (None, Some(own)) => own,
            (None, None) => return None,
        };
        Some((*pick.0, pick.1.clone()))
    }
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    fn mode(&self) -> TxnMode {
        self.mode
    }

    async fn get(&mut self, key: i64) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(&key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.records.records.read().get(&key).cloned())
    }

    async fn put(&mut self, key: i64, value: Vec<u8>) -> Result<()> {
        if self.mode != TxnMode::ReadWrite {
            bail!("put on key {key} inside a read-only transaction");
        }
        self.pending.insert(key, value);
        Ok(())
    }

    async fn open_cursor(&mut self, start: i64, direction: Direction) -> Result<CursorId> {
        let id = CursorId(self.cursors.len());
        self.cursors.push(Some(MemoryCursor {
            next: Some(start),
            direction,
        }));
        Ok(id)
    }

    async fn cursor_next(&mut self, cursor: CursorId) -> Result<Option<(i64, Vec<u8>)>> {
        let (bound, direction) = match self.cursors.get(cursor.0) {
            Some(Some(state)) => (state.next, state.direction),
            _ => return Err(anyhow!("cursor {} is not open", cursor.0)),
        };
        let Some(bound) = bound else {
            return Ok(None);
        };
        let found = self.seek(bound, direction);
        let next = found.as_ref().and_then(|(key, _)| match direction {
            Direction::Forward => key.checked_add(1),
            Direction::Backward => key.checked_sub(1),
        });
        if let Some(Some(state)) = self.cursors.get_mut(cursor.0) {
            state.next = if found.is_some() { next } else { None };
        }
        Ok(found)
    }

    fn close_cursor(&mut self, cursor: CursorId) {
        if let Some(slot) = self.cursors.get_mut(cursor.0) {
            *slot = None;
        }
    }

    async fn commit(self) -> Result<()> {
        if !self.pending.is_empty() {
            let mut records = self.records.records.write();
            for (key, value) in self.pending {
                records.insert(key, value);
            }
        }
        Ok(())
    }
}
