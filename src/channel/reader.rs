use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::trace;

use super::{ChannelError, ControlWord, Region, SharedBuffer, FINALIZED};

pub struct Reader {
    buffer: Arc<SharedBuffer>,
    offset: usize,
    peeking: bool,
}

impl Reader {
    pub fn new(buffer: Arc<SharedBuffer>) -> Self {
        Self {
            buffer,
            offset: 0,
            peeking: false,
        }
    }

    pub fn int32(&mut self) -> Result<i32, ChannelError> {
        self.take("int32", |data, offset| {
            let raw = read_array::<4>(data, offset)?;
            Ok(i32::from_be_bytes(raw))
        })
    }

    pub fn string(&mut self) -> Result<String, ChannelError> {
        self.take("string", |data, offset| {
            let byte_len = read_len(data, offset)?;
            if byte_len % 2 != 0 {
                return Err(ChannelError::Malformed(format!(
                    "odd string byte length {byte_len}"
                )));
            }
            let raw = read_slice(data, offset, byte_len)?;
            let units = raw
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>();
            String::from_utf16(&units)
                .map_err(|err| ChannelError::Malformed(format!("invalid utf-16 string: {err}")))
        })
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.take("bytes", |data, offset| {
            let byte_len = read_len(data, offset)?;
            Ok(read_slice(data, offset, byte_len)?.to_vec())
        })
    }

    /// Consumes the current value without decoding it.
    pub fn skip(&mut self) -> Result<(), ChannelError> {
        self.take("skip", |_, _| Ok(()))
    }

    /// Whether the pending value is the end-of-message marker. The marker is
    /// consumed (and the region handed back) only when it is present.
    pub fn done(&mut self) -> Result<bool, ChannelError> {
        let buffer = Arc::clone(&self.buffer);
        let mut region = wait_readable(&buffer)?;
        let mut cursor = self.offset;
        let marker = read_array::<4>(&region.data, &mut cursor).map(u32::from_be_bytes)?;
        if marker != FINALIZED {
            return Ok(false);
        }
        trace!("channel message finalized");
        if !self.peeking {
            self.flip(&buffer, &mut region)?;
        }
        Ok(true)
    }

    /// Runs `f` against the pending value and rewinds, leaving it unconsumed.
    pub fn peek<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let saved_offset = self.offset;
        let was_peeking = std::mem::replace(&mut self.peeking, true);
        let result = f(self);
        self.peeking = was_peeking;
        self.offset = saved_offset;
        result
    }

    fn take<T>(
        &mut self,
        what: &'static str,
        decode: impl FnOnce(&[u8], &mut usize) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let buffer = Arc::clone(&self.buffer);
        let mut region = wait_readable(&buffer)?;
        trace!(what, peeking = self.peeking, "channel value readable");
        let value = decode(&region.data, &mut self.offset)?;
        if !self.peeking {
            self.flip(&buffer, &mut region)?;
        }
        Ok(value)
    }

    fn flip(
        &mut self,
        buffer: &SharedBuffer,
        region: &mut MutexGuard<'_, Region>,
    ) -> Result<(), ChannelError> {
        region.transition(ControlWord::Readable, ControlWord::Writable)?;
        self.offset = 0;
        buffer.notify();
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

fn wait_readable(buffer: &SharedBuffer) -> Result<MutexGuard<'_, Region>, ChannelError> {
    let mut region = buffer.lock();
    buffer.wait_while(&mut region, ControlWord::Writable);
    if region.control != ControlWord::Readable {
        return Err(ChannelError::Disconnected);
    }
    Ok(region)
}

fn read_slice<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], ChannelError> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            ChannelError::Malformed(format!(
                "frame of {len} bytes at offset {offset} exceeds {} byte region",
                data.len()
            ))
        })?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_array<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N], ChannelError> {
    let mut out = [0_u8; N];
    out.copy_from_slice(read_slice(data, offset, N)?);
    Ok(out)
}

fn read_len(data: &[u8], offset: &mut usize) -> Result<usize, ChannelError> {
    let raw = read_array::<4>(data, offset)?;
    Ok(u32::from_be_bytes(raw) as usize)
}
