//! Worker-side view of the persistent store: one keyed record space per file
//! name, transactions, and bidirectional cursors.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Index of a cursor inside the transaction that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub usize);

#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    type Handle: StoreHandle;

    async fn open(&self, name: &str) -> Result<Self::Handle>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait StoreHandle: Clone + Send + Sync + 'static {
    type Txn: StoreTxn;

    /// Read/write transactions are exclusive per file; beginning one waits
    /// for the previous writer to finish.
    async fn begin(&self, mode: TxnMode) -> Result<Self::Txn>;
}

#[async_trait]
pub trait StoreTxn: Send + 'static {
    fn mode(&self) -> TxnMode;

    async fn get(&mut self, key: i64) -> Result<Option<Vec<u8>>>;

    async fn put(&mut self, key: i64, value: Vec<u8>) -> Result<()>;

    /// Opens a cursor positioned before the first record at or beyond `start`
    /// in `direction`.
    async fn open_cursor(&mut self, start: i64, direction: Direction) -> Result<CursorId>;

    /// Next record in the cursor's direction, `None` once exhausted.
    async fn cursor_next(&mut self, cursor: CursorId) -> Result<Option<(i64, Vec<u8>)>>;

    fn close_cursor(&mut self, cursor: CursorId);

    /// Commits and waits until the writes are durable. Dropping a
    /// transaction without committing aborts it.
    async fn commit(self) -> Result<()>;
}
