use anyhow::Result;

use crate::types::{Block, FileMeta, LockLevel};

/// Block-level primitives a [`File`](super::File) drives. Reads of positions
/// that were never written return zero-filled blocks.
pub trait FileOps {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn read_blocks(&mut self, positions: &[u64], block_size: u32) -> Result<Vec<Block>>;

    fn write_blocks(&mut self, writes: &[Block], block_size: u32) -> Result<()>;

    /// `None` when the file has no metadata yet.
    fn read_meta(&mut self) -> Result<Option<FileMeta>>;

    fn write_meta(&mut self, meta: &FileMeta) -> Result<()>;

    /// `Ok(false)` means busy.
    fn lock(&mut self, level: LockLevel) -> Result<bool>;

    fn unlock(&mut self, level: LockLevel) -> Result<bool>;

    fn delete(&mut self) -> Result<()>;
}

/// Hands out per-file [`FileOps`] over one shared store.
pub trait Backend {
    type Ops: FileOps;

    fn create_file(&self, name: &str) -> Self::Ops;
}
