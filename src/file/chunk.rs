//! Byte-range to block arithmetic.

use crate::types::Block;

/// One block touched by a write: the bytes to place and where they land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite<'a> {
    pub pos: u64,
    pub data: &'a [u8],
    pub offset: usize,
}

impl BlockWrite<'_> {
    pub fn covers_block(&self, block_size: u32) -> bool {
        self.offset == 0 && self.data.len() == block_size as usize
    }
}

/// Start positions of every block overlapping `[start, end)`.
pub fn boundary_positions(block_size: u32, start: u64, end: u64) -> Vec<u64> {
    if end <= start {
        return Vec::new();
    }
    let block_size = u64::from(block_size);
    let first = start - start % block_size;
    let last = (end - 1) - (end - 1) % block_size;
    (first..=last).step_by(block_size as usize).collect()
}

/// Splits `data`, destined for byte offset `start`, into per-block pieces.
pub fn split_writes(data: &[u8], block_size: u32, start: u64) -> Vec<BlockWrite<'_>> {
    let end = start + data.len() as u64;
    let block_len = u64::from(block_size);
    let mut cursor = 0_usize;
    boundary_positions(block_size, start, end)
        .into_iter()
        .map(|pos| {
            let from = start.max(pos);
            let until = end.min(pos + block_len);
            let len = (until - from) as usize;
            let piece = BlockWrite {
                pos,
                data: &data[cursor..cursor + len],
                offset: (from - pos) as usize,
            };
            cursor += len;
            piece
        })
        .collect()
}

/// Overlays a partial write onto the block's existing contents.
pub fn merge_into(block: &mut Block, write: &BlockWrite<'_>) {
    block.data[write.offset..write.offset + write.data.len()].copy_from_slice(write.data);
}

/// Copies `[start, end)` out of position-sorted `blocks` into `dst`.
/// Returns the number of bytes placed.
pub fn assemble_read(blocks: &[Block], start: u64, end: u64, dst: &mut [u8]) -> usize {
    let mut cursor = 0_usize;
    for block in blocks {
        let block_end = block.pos + block.data.len() as u64;
        if block_end <= start || block.pos >= end {
            continue;
        }
        let from = (start.max(block.pos) - block.pos) as usize;
        let until = (end.min(block_end) - block.pos) as usize;
        let len = until - from;
        dst[cursor..cursor + len].copy_from_slice(&block.data[from..until]);
        cursor += len;
    }
    cursor
}

/// Re-cuts position-keyed blocks into blocks of `new_size`. Gaps between
/// the given blocks become zeros.
pub fn rechunk(blocks: &[Block], new_size: u32) -> Vec<Block> {
    let Some(end) = blocks
        .iter()
        .map(|block| block.pos + block.data.len() as u64)
        .max()
    else {
        return Vec::new();
    };
    let new_len = u64::from(new_size);
    let padded = end.div_ceil(new_len) * new_len;
    let mut flat = vec![0_u8; padded as usize];
    for block in blocks {
        let at = block.pos as usize;
        flat[at..at + block.data.len()].copy_from_slice(&block.data);
    }
    flat.chunks(new_size as usize)
        .enumerate()
        .map(|(idx, data)| Block {
            pos: idx as u64 * new_len,
            data: data.to_vec(),
        })
        .collect()
}
