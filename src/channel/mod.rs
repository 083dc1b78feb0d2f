//! Turn-taking binary channel over a fixed shared region.
//!
//! A region carries exactly one framed value per turn. The writer may only
//! touch the payload while the control word is [`ControlWord::Writable`]; it
//! then flips the word to [`ControlWord::Readable`] and blocks until the
//! reader flips it back. Messages end with [`FINALIZED`] written in place of
//! a value.

mod reader;
mod writer;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

pub use reader::Reader;
pub use writer::Writer;

/// End-of-message marker.
pub const FINALIZED: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWord {
    Writable,
    Readable,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel out of turn: expected {expected:?}, control word is {found:?}")]
    OutOfTurn {
        expected: ControlWord,
        found: ControlWord,
    },
    #[error("value of {needed} bytes does not fit a {capacity} byte region")]
    Overflow { needed: usize, capacity: usize },
    #[error("channel peer disconnected")]
    Disconnected,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub(crate) struct Region {
    pub(crate) control: ControlWord,
    pub(crate) closed: bool,
    pub(crate) data: Box<[u8]>,
}

impl Region {
    /// Checked flip of the control word. A mismatch means two parties raced
    /// on the same side of the region.
    pub(crate) fn transition(
        &mut self,
        from: ControlWord,
        to: ControlWord,
    ) -> Result<(), ChannelError> {
        if self.control != from {
            return Err(ChannelError::OutOfTurn {
                expected: from,
                found: self.control,
            });
        }
        self.control = to;
        Ok(())
    }
}

pub struct SharedBuffer {
    region: Mutex<Region>,
    turn: Condvar,
    capacity: usize,
}

impl SharedBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            region: Mutex::new(Region {
                control: ControlWord::Writable,
                closed: false,
                data: vec![0_u8; capacity].into_boxed_slice(),
            }),
            turn: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> ControlWord {
        self.region.lock().control
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Region> {
        self.region.lock()
    }

    /// Blocks while the control word equals `state` and the peer is alive.
    pub(crate) fn wait_while(&self, guard: &mut MutexGuard<'_, Region>, state: ControlWord) {
        while guard.control == state && !guard.closed {
            self.turn.wait(guard);
        }
    }

    pub(crate) fn notify(&self) {
        self.turn.notify_all();
    }

    pub(crate) fn close(&self) {
        self.region.lock().closed = true;
        self.turn.notify_all();
    }
}

/// Both regions of a caller/worker pair: requests travel on `args`,
/// responses on `results`.
#[derive(Clone)]
pub struct ChannelPair {
    pub args: Arc<SharedBuffer>,
    pub results: Arc<SharedBuffer>,
}

impl ChannelPair {
    pub fn new(capacity: usize) -> Self {
        Self {
            args: SharedBuffer::new(capacity),
            results: SharedBuffer::new(capacity),
        }
    }

    /// Caller end: writes requests, reads responses.
    pub fn caller(&self) -> (Writer, Reader) {
        (
            Writer::new(Arc::clone(&self.args)),
            Reader::new(Arc::clone(&self.results)),
        )
    }

    /// Worker end: reads requests, writes responses.
    pub fn worker(&self) -> (Reader, Writer) {
        (
            Reader::new(Arc::clone(&self.args)),
            Writer::new(Arc::clone(&self.results)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn values_arrive_in_order() {
        let buffer = SharedBuffer::new(1024);
        let mut writer = Writer::new(Arc::clone(&buffer));
        let mut reader = Reader::new(Arc::clone(&buffer));

        let producer = thread::spawn(move || -> Result<(), ChannelError> {
            writer.string("readBlocks")?;
            writer.int32(-42)?;
            writer.bytes(&[1, 2, 3])?;
            writer.string("héllo ✓")?;
            writer.bytes(&[])?;
            writer.finalize()
        });

        assert_eq!(reader.string().expect("string"), "readBlocks");
        assert!(!reader.done().expect("not done"));
        assert_eq!(reader.int32().expect("int"), -42);
        assert_eq!(reader.bytes().expect("bytes"), vec![1, 2, 3]);
        assert_eq!(reader.string().expect("unicode"), "héllo ✓");
        assert!(reader.bytes().expect("empty bytes").is_empty());
        assert!(reader.done().expect("done"));
        producer.join().expect("join").expect("producer");
        assert_eq!(buffer.state(), ControlWord::Writable);
    }

    #[test]
    fn peek_does_not_consume() {
        let buffer = SharedBuffer::new(256);
        let mut writer = Writer::new(Arc::clone(&buffer));
        let mut reader = Reader::new(Arc::clone(&buffer));

        let producer = thread::spawn(move || -> Result<(), ChannelError> {
            writer.string("lockFile")?;
            writer.int32(7)?;
            writer.finalize()
        });

        let peeked = reader.peek(|r| r.string()).expect("peek");
        assert_eq!(peeked, "lockFile");
        assert_eq!(buffer.state(), ControlWord::Readable);
        assert_eq!(reader.string().expect("string"), "lockFile");
        assert_eq!(reader.int32().expect("int"), 7);
        assert!(reader.done().expect("done"));
        producer.join().expect("join").expect("producer");
    }

    #[test]
    fn second_writer_out_of_turn_fails() {
        let buffer = SharedBuffer::new(256);
        let mut first = Writer::new(Arc::clone(&buffer));
        let mut second = Writer::new(Arc::clone(&buffer));
        let mut reader = Reader::new(Arc::clone(&buffer));

        let producer = thread::spawn(move || first.int32(1));
        while buffer.state() != ControlWord::Readable {
            thread::sleep(Duration::from_millis(1));
        }

        let err = second.int32(2).expect_err("writing out of turn must fail");
        assert!(matches!(
            err,
            ChannelError::OutOfTurn {
                expected: ControlWord::Writable,
                found: ControlWord::Readable
            }
        ));

        assert_eq!(reader.int32().expect("first value intact"), 1);
        producer.join().expect("join").expect("producer");
    }

    #[test]
    fn oversized_value_is_rejected() {
        let buffer = SharedBuffer::new(16);
        let mut writer = Writer::new(buffer);
        let err = writer.bytes(&[0_u8; 32]).expect_err("must overflow");
        assert!(matches!(err, ChannelError::Overflow { needed: 36, capacity: 16 }));
    }

    #[test]
    fn dropped_peer_unblocks_reader() {
        let buffer = SharedBuffer::new(64);
        let writer = Writer::new(Arc::clone(&buffer));
        let mut reader = Reader::new(Arc::clone(&buffer));

        let consumer = thread::spawn(move || reader.int32());
        thread::sleep(Duration::from_millis(10));
        drop(writer);
        let err = consumer.join().expect("join").expect_err("peer gone");
        assert!(matches!(err, ChannelError::Disconnected));
    }
}
