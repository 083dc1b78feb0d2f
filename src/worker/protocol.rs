//! Request and response messages carried over a [`ChannelPair`](crate::channel::ChannelPair).
//!
//! A request is the method name followed by its arguments; a response starts
//! with a status word. Both end with the channel's end-of-message marker.

use crate::channel::{ChannelError, Reader, Writer};

pub mod method {
    pub const READ_BLOCKS: &str = "readBlocks";
    pub const WRITE_BLOCKS: &str = "writeBlocks";
    pub const READ_META: &str = "readMeta";
    pub const WRITE_META: &str = "writeMeta";
    pub const LOCK_FILE: &str = "lockFile";
    pub const UNLOCK_FILE: &str = "unlockFile";
    pub const DELETE_FILE: &str = "deleteFile";
    pub const CLOSE_FILE: &str = "closeFile";
    pub const SHUTDOWN: &str = "shutdown";
}

pub const STATUS_OK: i32 = 0;
pub const STATUS_BUSY: i32 = -1;
pub const STATUS_ERROR: i32 = -2;

/// `readMeta` answer for a file with no metadata record.
pub const NO_META: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadBlocks { name: String, keys: Vec<i32> },
    WriteBlocks { name: String, blocks: Vec<(i32, Vec<u8>)> },
    ReadMeta { name: String },
    WriteMeta { name: String, size: i32, block_size: i32 },
    LockFile { name: String, level: i32 },
    UnlockFile { name: String, level: i32 },
    DeleteFile { name: String },
    CloseFile { name: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Status,
    Blocks,
    Meta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Status(i32),
    /// Missing blocks come back with empty data.
    Blocks(Vec<(i32, Vec<u8>)>),
    Meta { size: i32, block_size: i32 },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::ReadBlocks { .. } => method::READ_BLOCKS,
            Self::WriteBlocks { .. } => method::WRITE_BLOCKS,
            Self::ReadMeta { .. } => method::READ_META,
            Self::WriteMeta { .. } => method::WRITE_META,
            Self::LockFile { .. } => method::LOCK_FILE,
            Self::UnlockFile { .. } => method::UNLOCK_FILE,
            Self::DeleteFile { .. } => method::DELETE_FILE,
            Self::CloseFile { .. } => method::CLOSE_FILE,
            Self::Shutdown => method::SHUTDOWN,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::ReadBlocks { name, .. }
            | Self::WriteBlocks { name, .. }
            | Self::ReadMeta { name }
            | Self::WriteMeta { name, .. }
            | Self::LockFile { name, .. }
            | Self::UnlockFile { name, .. }
            | Self::DeleteFile { name }
            | Self::CloseFile { name } => Some(name),
            Self::Shutdown => None,
        }
    }

    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Self::ReadBlocks { .. } => ResponseKind::Blocks,
            Self::ReadMeta { .. } => ResponseKind::Meta,
            _ => ResponseKind::Status,
        }
    }

    pub fn write(&self, writer: &mut Writer) -> Result<(), ChannelError> {
        writer.string(self.method())?;
        match self {
            Self::ReadBlocks { name, keys } => {
                writer.string(name)?;
                for key in keys {
                    writer.int32(*key)?;
                }
            }
            Self::WriteBlocks { name, blocks } => {
                writer.string(name)?;
                for (key, data) in blocks {
                    writer.int32(*key)?;
                    writer.bytes(data)?;
                }
            }
            Self::WriteMeta {
                name,
                size,
                block_size,
            } => {
                writer.string(name)?;
                writer.int32(*size)?;
                writer.int32(*block_size)?;
            }
            Self::LockFile { name, level } | Self::UnlockFile { name, level } => {
                writer.string(name)?;
                writer.int32(*level)?;
            }
            Self::ReadMeta { name } | Self::DeleteFile { name } | Self::CloseFile { name } => {
                writer.string(name)?;
            }
            Self::Shutdown => {}
        }
        writer.finalize()
    }

    /// Decodes one request. A malformed message (unknown method included) is
    /// drained up to its marker before the error is returned.
    pub fn read(reader: &mut Reader) -> Result<Self, ChannelError> {
        match Self::decode(reader) {
            Err(ChannelError::Malformed(reason)) => {
                drain(reader)?;
                Err(ChannelError::Malformed(reason))
            }
            other => other,
        }
    }

    fn decode(reader: &mut Reader) -> Result<Self, ChannelError> {
        let method = reader.string()?;
        let request = match method.as_str() {
            method::READ_BLOCKS => {
                let name = reader.string()?;
                let mut keys = Vec::new();
                while !reader.done()? {
                    keys.push(reader.int32()?);
                }
                return Ok(Self::ReadBlocks { name, keys });
            }
            method::WRITE_BLOCKS => {
                let name = reader.string()?;
                let mut blocks = Vec::new();
                while !reader.done()? {
                    let key = reader.int32()?;
                    blocks.push((key, reader.bytes()?));
                }
                return Ok(Self::WriteBlocks { name, blocks });
            }
            method::READ_META => Self::ReadMeta {
                name: reader.string()?,
            },
            method::WRITE_META => Self::WriteMeta {
                name: reader.string()?,
                size: reader.int32()?,
                block_size: reader.int32()?,
            },
            method::LOCK_FILE => Self::LockFile {
                name: reader.string()?,
                level: reader.int32()?,
            },
            method::UNLOCK_FILE => Self::UnlockFile {
                name: reader.string()?,
                level: reader.int32()?,
            },
            method::DELETE_FILE => Self::DeleteFile {
                name: reader.string()?,
            },
            method::CLOSE_FILE => Self::CloseFile {
                name: reader.string()?,
            },
            method::SHUTDOWN => Self::Shutdown,
            other => {
                return Err(ChannelError::Malformed(format!("unknown method {other:?}")));
            }
        };
        expect_end(reader, request.method())?;
        Ok(request)
    }
}

impl Response {
    pub fn write(&self, writer: &mut Writer) -> Result<(), ChannelError> {
        match self {
            Self::Status(status) => writer.int32(*status)?,
            Self::Blocks(blocks) => {
                writer.int32(STATUS_OK)?;
                for (key, data) in blocks {
                    writer.int32(*key)?;
                    writer.bytes(data)?;
                }
            }
            Self::Meta { size, block_size } => {
                writer.int32(STATUS_OK)?;
                writer.int32(*size)?;
                writer.int32(*block_size)?;
            }
        }
        writer.finalize()
    }

    /// Decodes the answer to a request of `kind`. A non-ok status carries no
    /// payload and decodes as [`Response::Status`].
    pub fn read(reader: &mut Reader, kind: ResponseKind) -> Result<Self, ChannelError> {
        match Self::decode(reader, kind) {
            Err(ChannelError::Malformed(reason)) => {
                drain(reader)?;
                Err(ChannelError::Malformed(reason))
            }
            other => other,
        }
    }

    fn decode(reader: &mut Reader, kind: ResponseKind) -> Result<Self, ChannelError> {
        let status = reader.int32()?;
        if status != STATUS_OK {
            expect_end(reader, "status")?;
            return Ok(Self::Status(status));
        }
        let response = match kind {
            ResponseKind::Status => Self::Status(status),
            ResponseKind::Blocks => {
                let mut blocks = Vec::new();
                while !reader.done()? {
                    let key = reader.int32()?;
                    blocks.push((key, reader.bytes()?));
                }
                return Ok(Self::Blocks(blocks));
            }
            ResponseKind::Meta => Self::Meta {
                size: reader.int32()?,
                block_size: reader.int32()?,
            },
        };
        expect_end(reader, "response")?;
        Ok(response)
    }
}

/// Skips every remaining value of the current message, marker included.
/// Returns how many values were skipped.
pub fn drain(reader: &mut Reader) -> Result<usize, ChannelError> {
    let mut skipped = 0;
    while !reader.done()? {
        reader.skip()?;
        skipped += 1;
    }
    Ok(skipped)
}

fn expect_end(reader: &mut Reader, what: &str) -> Result<(), ChannelError> {
    if reader.done()? {
        return Ok(());
    }
    Err(ChannelError::Malformed(format!("trailing values after {what}")))
}
