use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use super::ops::{Backend, FileOps};
use crate::types::{Block, FileMeta, LockLevel};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpCounters {
    pub read_blocks_calls: u64,
    pub write_blocks_calls: u64,
    pub blocks_written: u64,
    pub write_meta_calls: u64,
}

#[derive(Default)]
struct StoredFile {
    blocks: HashMap<u64, Vec<u8>>,
    meta: Option<FileMeta>,
    lock: Option<LockLevel>,
}

#[derive(Default)]
struct Shared {
    files: HashMap<String, StoredFile>,
    counters: OpCounters,
}

/// Synchronous in-memory backend. Locks always succeed.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> OpCounters {
        self.shared.lock().counters
    }

    /// Stored block at `pos`, if one was ever written.
    pub fn stored_block(&self, name: &str, pos: u64) -> Option<Vec<u8>> {
        self.shared
            .lock()
            .files
            .get(name)
            .and_then(|file| file.blocks.get(&pos).cloned())
    }

    pub fn stored_meta(&self, name: &str) -> Option<FileMeta> {
        self.shared
            .lock()
            .files
            .get(name)
            .and_then(|file| file.meta.clone())
    }

    pub fn lock_level(&self, name: &str) -> LockLevel {
        self.shared
            .lock()
            .files
            .get(name)
            .and_then(|file| file.lock)
            .unwrap_or(LockLevel::None)
    }
}

impl Backend for MemoryBackend {
    type Ops = MemoryFileOps;

    fn create_file(&self, name: &str) -> MemoryFileOps {
        MemoryFileOps {
            name: name.to_owned(),
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct MemoryFileOps {
    name: String,
    shared: Arc<Mutex<Shared>>,
}

impl FileOps for MemoryFileOps {
    fn open(&mut self) -> Result<()> {
        self.shared.lock().files.entry(self.name.clone()).or_default();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, positions: &[u64], block_size: u32) -> Result<Vec<Block>> {
        let mut shared = self.shared.lock();
        shared.counters.read_blocks_calls += 1;
        let file = shared.files.get(&self.name);
        Ok(positions
            .iter()
            .map(|pos| Block {
                pos: *pos,
                data: file
                    .and_then(|file| file.blocks.get(pos).cloned())
                    .unwrap_or_else(|| vec![0_u8; block_size as usize]),
            })
            .collect())
    }

    fn write_blocks(&mut self, writes: &[Block], _block_size: u32) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.counters.write_blocks_calls += 1;
        shared.counters.blocks_written += writes.len() as u64;
        let file = shared.files.entry(self.name.clone()).or_default();
        for write in writes {
            file.blocks.insert(write.pos, write.data.clone());
        }
        Ok(())
    }

    fn read_meta(&mut self) -> Result<Option<FileMeta>> {
        Ok(self
            .shared
            .lock()
            .files
            .get(&self.name)
            .and_then(|file| file.meta.clone()))
    }

    fn write_meta(&mut self, meta: &FileMeta) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.counters.write_meta_calls += 1;
        shared.files.entry(self.name.clone()).or_default().meta = Some(FileMeta {
            size: meta.size,
            block_size: meta.block_size,
            mode: None,
        });
        Ok(())
    }

    fn lock(&mut self, level: LockLevel) -> Result<bool> {
        self.shared.lock().files.entry(self.name.clone()).or_default().lock = Some(level);
        Ok(true)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<bool> {
        self.shared.lock().files.entry(self.name.clone()).or_default().lock = Some(level);
        Ok(true)
    }

    fn delete(&mut self) -> Result<()> {
        self.shared.lock().files.remove(&self.name);
        Ok(())
    }
}
