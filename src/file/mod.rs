//! Byte-addressable file over a store that only speaks whole blocks.
//!
//! Writes are merged into full blocks and held in a dirty buffer until
//! [`File::fsync`]; reads consult the dirty buffer before the backend.

pub mod chunk;
pub mod memory;
pub mod ops;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use tracing::{debug, info};

use crate::types::{
    is_valid_page_size, page_size_field, read_page_size, Block, FileMeta, LockLevel, SetAttr,
};
use crate::util::anyhow_errno;
use chunk::{assemble_read, boundary_positions, merge_into, rechunk, split_writes};

pub use memory::{MemoryBackend, MemoryFileOps, OpCounters};
pub use ops::{Backend, FileOps};

pub struct File<O: FileOps> {
    name: String,
    ops: O,
    meta: FileMeta,
    meta_dirty: bool,
    dirty: HashMap<u64, Vec<u8>>,
    open_handles: usize,
    lock: LockLevel,
    /// Upper bound of the byte range the backend may hold blocks for.
    stored_end: u64,
}

impl<O: FileOps> File<O> {
    pub fn new(name: impl Into<String>, ops: O) -> Self {
        Self {
            name: name.into(),
            ops,
            meta: FileMeta::default(),
            meta_dirty: false,
            dirty: HashMap::new(),
            open_handles: 0,
            lock: LockLevel::None,
            stored_end: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn getattr(&self) -> &FileMeta {
        &self.meta
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.dirty.is_empty() || self.meta_dirty
    }

    pub fn open(&mut self) -> Result<()> {
        self.open_handles += 1;
        if self.open_handles > 1 {
            return Ok(());
        }
        let loaded = self.ops.open().and_then(|()| self.ops.read_meta());
        match loaded {
            Ok(meta) => {
                self.meta = meta.unwrap_or_default();
                self.meta_dirty = false;
                self.stored_end = self.meta.size;
                debug!(name = %self.name, size = self.meta.size, block_size = ?self.meta.block_size, "file opened");
                Ok(())
            }
            Err(err) => {
                self.open_handles = 0;
                Err(err.context(format!("failed to open {}", self.name)))
            }
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.fsync()?;
        self.open_handles = self.open_handles.saturating_sub(1);
        if self.open_handles == 0 {
            self.ops
                .close()
                .with_context(|| format!("failed to close {}", self.name))?;
        }
        Ok(())
    }

    pub fn delete(&mut self) -> Result<()> {
        self.ops
            .delete()
            .with_context(|| format!("failed to delete {}", self.name))?;
        self.dirty.clear();
        self.meta = FileMeta::default();
        self.meta_dirty = false;
        self.stored_end = 0;
        self.open_handles = 0;
        self.lock = LockLevel::None;
        Ok(())
    }

    pub fn setattr(&mut self, attr: SetAttr) -> Result<()> {
        if let Some(mode) = attr.mode {
            self.meta.mode = Some(mode);
        }
        if let Some(block_size) = attr.block_size {
            if !is_valid_page_size(block_size) {
                return Err(anyhow_errno(
                    Errno::EINVAL,
                    format!("corrupt page size {block_size} for {}", self.name),
                ));
            }
            self.meta.block_size = Some(block_size);
            self.meta_dirty = true;
        }
        if let Some(size) = attr.size {
            if size < self.meta.size {
                self.truncate_blocks(size)?;
            }
            self.meta.size = size;
            self.meta_dirty = true;
        }
        Ok(())
    }

    /// Copies `length` bytes at `position` into `dst[offset..]`. Bytes past
    /// the end of the file read as zeros; the full `length` is reported.
    pub fn read(
        &mut self,
        dst: &mut [u8],
        offset: usize,
        length: usize,
        position: i64,
    ) -> Result<usize> {
        if length == 0 || position < 0 {
            return Ok(0);
        }
        let dst_end = offset
            .checked_add(length)
            .filter(|end| *end <= dst.len())
            .ok_or_else(|| {
                anyhow_errno(
                    Errno::EINVAL,
                    format!(
                        "buffer given to read is too small: {} bytes at offset {offset}, requested {length}",
                        dst.len()
                    ),
                )
            })?;
        let dst = &mut dst[offset..dst_end];
        let position = position as u64;

        if position >= self.meta.size {
            dst.fill(0);
            return Ok(length);
        }

        let data_len = (self.meta.size - position).min(length as u64) as usize;
        // No block exists before the first write sets the block size.
        let Some(block_size) = self.meta.block_size else {
            dst.fill(0);
            return Ok(length);
        };
        let end = position + data_len as u64;
        let blocks = self.load(&boundary_positions(block_size, position, end), block_size)?;
        let copied = assemble_read(&blocks, position, end, &mut dst[..data_len]);
        if copied != data_len {
            bail!(
                "read of {} assembled {copied} of {data_len} bytes at {position}",
                self.name
            );
        }
        dst[data_len..].fill(0);
        Ok(length)
    }

    /// Buffers `src[offset..offset + length]` at `position`. Returns the
    /// number of bytes accepted (clamped to what `src` holds).
    pub fn write(&mut self, src: &[u8], offset: usize, length: usize, position: i64) -> Result<usize> {
        if length == 0 || position < 0 || src.is_empty() {
            return Ok(0);
        }
        let length = length.min(src.len().saturating_sub(offset));
        if length == 0 {
            return Ok(0);
        }
        let data = &src[offset..offset + length];
        let position = position as u64;

        let block_size = match self.meta.block_size {
            Some(block_size) => block_size,
            None => self.establish_block_size(data, position)?,
        };

        let (full, partial): (Vec<_>, Vec<_>) = split_writes(data, block_size, position)
            .into_iter()
            .partition(|write| write.covers_block(block_size));

        let mut merged = full
            .iter()
            .map(|write| Block {
                pos: write.pos,
                data: write.data.to_vec(),
            })
            .collect::<Vec<_>>();
        if !partial.is_empty() {
            let positions = partial.iter().map(|write| write.pos).collect::<Vec<_>>();
            for mut block in self.load(&positions, block_size)? {
                if let Some(write) = partial.iter().find(|write| write.pos == block.pos) {
                    merge_into(&mut block, write);
                    merged.push(block);
                }
            }
        }
        for block in merged {
            self.dirty.insert(block.pos, block.data);
        }

        let end = position + length as u64;
        if end > self.meta.size {
            self.meta.size = end;
            self.meta_dirty = true;
        }
        Ok(length)
    }

    /// Pushes dirty blocks and metadata to the backend. No-op when clean.
    pub fn fsync(&mut self) -> Result<()> {
        if !self.dirty.is_empty() {
            let mut block_size = self.block_size()?;
            let mut blocks = self
                .dirty
                .iter()
                .map(|(pos, data)| Block {
                    pos: *pos,
                    data: data.clone(),
                })
                .collect::<Vec<_>>();
            blocks.sort_by_key(|block| block.pos);

            if let Some(new_size) = migration_target(&blocks, block_size) {
                info!(
                    name = %self.name,
                    from = block_size,
                    to = new_size,
                    "page size changed, re-chunking pending blocks"
                );
                blocks = rechunk(&blocks, new_size);
                block_size = new_size;
                self.meta.block_size = Some(new_size);
                self.meta_dirty = true;
            }

            self.ops
                .write_blocks(&blocks, block_size)
                .with_context(|| format!("failed to flush blocks of {}", self.name))?;
            debug!(name = %self.name, blocks = blocks.len(), "flushed dirty blocks");
            if let Some(last) = blocks.last() {
                self.stored_end = self.stored_end.max(last.pos + u64::from(block_size));
            }
            self.dirty.clear();
        }
        if self.meta_dirty {
            self.ops
                .write_meta(&self.meta)
                .with_context(|| format!("failed to flush metadata of {}", self.name))?;
            self.meta_dirty = false;
        }
        Ok(())
    }

    /// `Ok(false)` when the lock is busy.
    pub fn lock(&mut self, level: LockLevel) -> Result<bool> {
        let granted = self
            .ops
            .lock(level)
            .with_context(|| format!("failed to lock {} at {level}", self.name))?;
        if granted {
            self.lock = self.lock.max(level.effective());
        } else {
            debug!(name = %self.name, %level, "lock busy");
        }
        Ok(granted)
    }

    /// Flushes pending writes, then drops the lock to `level`.
    pub fn unlock(&mut self, level: LockLevel) -> Result<bool> {
        if self.has_pending_writes() {
            self.fsync()?;
        }
        let released = self
            .ops
            .unlock(level)
            .with_context(|| format!("failed to unlock {} to {level}", self.name))?;
        if released {
            self.lock = level;
        }
        Ok(released)
    }

    fn block_size(&self) -> Result<u32> {
        self.meta
            .block_size
            .with_context(|| format!("block size of {} is not established", self.name))
    }

    /// The first write of a new file carries the database header; its page
    /// size becomes the block size.
    fn establish_block_size(&mut self, data: &[u8], position: u64) -> Result<u32> {
        if position != 0 {
            return Err(anyhow_errno(
                Errno::EINVAL,
                format!(
                    "first write to {} must start at position 0, got {position}",
                    self.name
                ),
            ));
        }
        let block_size = read_page_size(data)
            .with_context(|| format!("cannot derive block size of {}", self.name))?;
        debug!(name = %self.name, block_size, "block size established from header");
        self.meta.block_size = Some(block_size);
        self.meta_dirty = true;
        Ok(block_size)
    }

    /// Resolves blocks from the dirty buffer, fetching the rest in one call.
    fn load(&mut self, positions: &[u64], block_size: u32) -> Result<Vec<Block>> {
        let mut blocks = Vec::with_capacity(positions.len());
        let mut missing = Vec::new();
        for pos in positions {
            match self.dirty.get(pos) {
                Some(data) => blocks.push(Block {
                    pos: *pos,
                    data: data.clone(),
                }),
                None => missing.push(*pos),
            }
        }
        if !missing.is_empty() {
            let fetched = self
                .ops
                .read_blocks(&missing, block_size)
                .with_context(|| format!("failed to read blocks of {}", self.name))?;
            if let Some(bad) = fetched
                .iter()
                .find(|block| block.data.len() != block_size as usize)
            {
                return Err(anyhow_errno(
                    Errno::EIO,
                    format!(
                        "block {} of {} has {} bytes, expected {block_size}",
                        bad.pos,
                        self.name,
                        bad.data.len()
                    ),
                ));
            }
            blocks.extend(fetched);
        }
        blocks.sort_by_key(|block| block.pos);
        Ok(blocks)
    }

    /// Zeroes everything from `new_size` up to the current size so that a
    /// later extension reads zeros there. Only blocks the backend may hold
    /// are rewritten.
    fn truncate_blocks(&mut self, new_size: u64) -> Result<()> {
        let Some(block_size) = self.meta.block_size else {
            return Ok(());
        };
        let block_len = u64::from(block_size);
        self.dirty.retain(|pos, _| *pos < new_size);

        let tail = new_size % block_len;
        if tail != 0 {
            let pos = new_size - tail;
            let mut block = self
                .load(&[pos], block_size)?
                .pop()
                .with_context(|| format!("boundary block {pos} of {} missing", self.name))?;
            block.data[tail as usize..].fill(0);
            self.dirty.insert(pos, block.data);
        }

        let stale_end = self.meta.size.min(self.stored_end);
        let mut pos = new_size.div_ceil(block_len) * block_len;
        while pos < stale_end {
            self.dirty.insert(pos, vec![0_u8; block_size as usize]);
            pos += block_len;
        }
        Ok(())
    }
}

/// New block size when the pending block 0 advertises a different valid
/// page size than the file uses.
fn migration_target(blocks: &[Block], current: u32) -> Option<u32> {
    let first = blocks.iter().find(|block| block.pos == 0)?;
    let advertised = page_size_field(&first.data)?;
    if advertised == current || !is_valid_page_size(advertised) {
        return None;
    }
    Some(advertised)
}
