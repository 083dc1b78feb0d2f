//! Caller side of the worker bridge: [`FileOps`] implemented as blocking
//! round-trips over the wire channel.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::protocol::{Request, Response, NO_META, STATUS_BUSY, STATUS_OK};
use crate::channel::{Reader, Writer};
use crate::file::FileOps;
use crate::types::{block_key, block_pos, Block, FileMeta, LockLevel};
use crate::util::anyhow_errno;

/// One caller end of a channel pair. Exactly one request is in flight at a
/// time; holders serialize through the surrounding mutex.
pub struct Connection {
    writer: Writer,
    reader: Reader,
}

impl Connection {
    pub fn new(writer: Writer, reader: Reader) -> Self {
        Self { writer, reader }
    }

    pub fn call(&mut self, request: &Request) -> Result<Response> {
        let method = request.method();
        request
            .write(&mut self.writer)
            .with_context(|| format!("failed to send {method} request"))?;
        let response = Response::read(&mut self.reader, request.response_kind())
            .with_context(|| format!("failed to read {method} response"))?;
        trace!(method, "worker call completed");
        Ok(response)
    }
}

pub struct ChannelFileOps {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl ChannelFileOps {
    pub fn new(name: impl Into<String>, conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    fn call(&self, request: Request) -> Result<Response> {
        self.conn.lock().call(&request)
    }

    /// Status-only round trip. `Ok(false)` when the worker reports busy.
    fn call_status(&self, request: Request) -> Result<bool> {
        let method = request.method();
        match self.call(request)? {
            Response::Status(STATUS_OK) => Ok(true),
            Response::Status(STATUS_BUSY) => Ok(false),
            other => Err(self.worker_failure(method, &other)),
        }
    }

    fn worker_failure(&self, method: &str, response: &Response) -> anyhow::Error {
        anyhow_errno(
            Errno::EIO,
            format!("worker failed {method} for {}: {response:?}", self.name),
        )
    }

    fn wire_key(&self, pos: u64, block_size: u32) -> Result<i32> {
        i32::try_from(block_key(pos, block_size)).map_err(|_| {
            anyhow_errno(
                Errno::EFBIG,
                format!("block at {pos} of {} is beyond the wire key range", self.name),
            )
        })
    }
}

impl FileOps for ChannelFileOps {
    /// Store handles are opened lazily by the worker.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let name = self.name.clone();
        self.call_status(Request::CloseFile { name })?;
        Ok(())
    }

    fn read_blocks(&mut self, positions: &[u64], block_size: u32) -> Result<Vec<Block>> {
        let keys = positions
            .iter()
            .map(|pos| self.wire_key(*pos, block_size))
            .collect::<Result<Vec<_>>>()?;
        let request = Request::ReadBlocks {
            name: self.name.clone(),
            keys,
        };
        let found = match self.call(request)? {
            Response::Blocks(blocks) => blocks,
            other => return Err(self.worker_failure("readBlocks", &other)),
        };

        let mut by_pos = found
            .into_iter()
            .filter(|(_, data)| !data.is_empty())
            .filter_map(|(key, data)| {
                let key = u64::try_from(key).ok()?;
                Some((block_pos(key, block_size), data))
            })
            .collect::<HashMap<_, _>>();
        Ok(positions
            .iter()
            .map(|pos| Block {
                pos: *pos,
                data: by_pos
                    .remove(pos)
                    .unwrap_or_else(|| vec![0_u8; block_size as usize]),
            })
            .collect())
    }

    fn write_blocks(&mut self, writes: &[Block], block_size: u32) -> Result<()> {
        let blocks = writes
            .iter()
            .map(|block| Ok((self.wire_key(block.pos, block_size)?, block.data.clone())))
            .collect::<Result<Vec<_>>>()?;
        let request = Request::WriteBlocks {
            name: self.name.clone(),
            blocks,
        };
        match self.call(request)? {
            Response::Status(STATUS_OK) => Ok(()),
            other => Err(self.worker_failure("writeBlocks", &other)),
        }
    }

    fn read_meta(&mut self) -> Result<Option<FileMeta>> {
        let request = Request::ReadMeta {
            name: self.name.clone(),
        };
        match self.call(request)? {
            Response::Meta {
                size: NO_META,
                block_size: NO_META,
            } => Ok(None),
            Response::Meta { size, block_size } => Ok(Some(FileMeta {
                size: u64::try_from(size).with_context(|| {
                    format!("worker returned negative size {size} for {}", self.name)
                })?,
                block_size: u32::try_from(block_size).ok().filter(|size| *size > 0),
                mode: None,
            })),
            other => Err(self.worker_failure("readMeta", &other)),
        }
    }

    fn write_meta(&mut self, meta: &FileMeta) -> Result<()> {
        let size = i32::try_from(meta.size).map_err(|_| {
            anyhow_errno(
                Errno::EFBIG,
                format!("size {} of {} does not fit the wire format", meta.size, self.name),
            )
        })?;
        let block_size = match meta.block_size {
            Some(block_size) => i32::try_from(block_size).context("block size out of range")?,
            None => 0,
        };
        let request = Request::WriteMeta {
            name: self.name.clone(),
            size,
            block_size,
        };
        match self.call(request)? {
            Response::Status(STATUS_OK) => Ok(()),
            other => Err(self.worker_failure("writeMeta", &other)),
        }
    }

    fn lock(&mut self, level: LockLevel) -> Result<bool> {
        let granted = self.call_status(Request::LockFile {
            name: self.name.clone(),
            level: level.as_i32(),
        })?;
        if !granted {
            debug!(name = %self.name, %level, "worker reported lock busy");
        }
        Ok(granted)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<bool> {
        self.call_status(Request::UnlockFile {
            name: self.name.clone(),
            level: level.as_i32(),
        })
    }

    fn delete(&mut self) -> Result<()> {
        let name = self.name.clone();
        self.call_status(Request::DeleteFile { name })?;
        Ok(())
    }
}
