use std::sync::Arc;

use tracing::trace;

use super::{ChannelError, ControlWord, SharedBuffer, FINALIZED};

pub struct Writer {
    buffer: Arc<SharedBuffer>,
}

impl Writer {
    pub fn new(buffer: Arc<SharedBuffer>) -> Self {
        Self { buffer }
    }

    pub fn int32(&mut self, value: i32) -> Result<(), ChannelError> {
        self.put("int32", 4, |out| out.copy_from_slice(&value.to_be_bytes()))
    }

    pub fn string(&mut self, value: &str) -> Result<(), ChannelError> {
        let units = value.encode_utf16().collect::<Vec<_>>();
        let byte_len = units.len() * 2;
        let prefix = frame_len(byte_len)?;
        self.put("string", 4 + byte_len, |out| {
            out[..4].copy_from_slice(&prefix.to_be_bytes());
            for (slot, unit) in out[4..].chunks_exact_mut(2).zip(units) {
                slot.copy_from_slice(&unit.to_be_bytes());
            }
        })
    }

    pub fn bytes(&mut self, value: &[u8]) -> Result<(), ChannelError> {
        let prefix = frame_len(value.len())?;
        self.put("bytes", 4 + value.len(), |out| {
            out[..4].copy_from_slice(&prefix.to_be_bytes());
            out[4..].copy_from_slice(value);
        })
    }

    /// Ends the current message.
    pub fn finalize(&mut self) -> Result<(), ChannelError> {
        self.put("finalize", 4, |out| out.copy_from_slice(&FINALIZED.to_be_bytes()))
    }

    /// Writes one value, hands the region to the reader and blocks until it is
    /// handed back.
    fn put(
        &mut self,
        what: &'static str,
        needed: usize,
        encode: impl FnOnce(&mut [u8]),
    ) -> Result<(), ChannelError> {
        let capacity = self.buffer.capacity();
        if needed > capacity {
            return Err(ChannelError::Overflow { needed, capacity });
        }

        let buffer = Arc::clone(&self.buffer);
        let mut region = buffer.lock();
        if region.control != ControlWord::Writable {
            return Err(ChannelError::OutOfTurn {
                expected: ControlWord::Writable,
                found: region.control,
            });
        }
        if region.closed {
            return Err(ChannelError::Disconnected);
        }

        encode(&mut region.data[..needed]);
        region.transition(ControlWord::Writable, ControlWord::Readable)?;
        buffer.notify();
        trace!(what, bytes = needed, "channel value written");

        buffer.wait_while(&mut region, ControlWord::Readable);
        if region.control != ControlWord::Writable {
            return Err(ChannelError::Disconnected);
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

fn frame_len(len: usize) -> Result<u32, ChannelError> {
    u32::try_from(len).map_err(|_| ChannelError::Overflow {
        needed: len,
        capacity: u32::MAX as usize,
    })
}
