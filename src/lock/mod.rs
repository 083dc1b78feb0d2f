//! Maps the caller's lock levels onto store transactions.
//!
//! A file holding SHARED owns a read-only transaction; EXCLUSIVE owns a
//! read/write one. The first block is cached when a lock is acquired and
//! compared again on upgrade: if its change counter moved, somebody else
//! committed in between and the upgrade reports busy.

pub mod read_strategy;

use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{StoreHandle, StoreTxn, TxnMode};
use crate::types::{first_block_unchanged, LockLevel};

pub use read_strategy::{CursorState, ReadHistory, ReadStrategy, ReadTuning};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("invalid lock transition {from} -> {to}")]
    InvalidTransition { from: LockLevel, to: LockLevel },
    #[error("no lock held on {0}")]
    NotHeld(String),
    #[error("write to {0} without an EXCLUSIVE lock")]
    WriteWithoutExclusive(String),
}

pub struct Transaction<H: StoreHandle> {
    handle: H,
    txn: Option<H::Txn>,
    lock: LockLevel,
    cached_first_block: Option<Vec<u8>>,
    history: ReadHistory,
    strategy: ReadStrategy,
}

impl<H: StoreHandle> Transaction<H> {
    /// NONE -> SHARED. Opens a read transaction and caches block 0.
    pub async fn acquire_shared(handle: H) -> Result<Self> {
        let mut txn = handle
            .begin(TxnMode::ReadOnly)
            .await
            .context("failed to begin read transaction")?;
        let first = txn.get(0).await.context("failed to prefetch first block")?;
        Ok(Self {
            handle,
            txn: Some(txn),
            lock: LockLevel::Shared,
            cached_first_block: first,
            history: ReadHistory::default(),
            strategy: ReadStrategy::Keyed,
        })
    }

    /// Transaction with no lock behind it, used for reads and writes issued
    /// while the caller holds nothing.
    pub async fn ad_hoc(handle: H, mode: TxnMode) -> Result<Self> {
        let txn = handle
            .begin(mode)
            .await
            .context("failed to begin ad-hoc transaction")?;
        Ok(Self {
            handle,
            txn: Some(txn),
            lock: LockLevel::None,
            cached_first_block: None,
            history: ReadHistory::default(),
            strategy: ReadStrategy::Keyed,
        })
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock
    }

    pub fn mode(&self) -> Option<TxnMode> {
        self.txn.as_ref().map(|txn| txn.mode())
    }

    pub fn strategy(&self) -> &ReadStrategy {
        &self.strategy
    }

    /// SHARED -> EXCLUSIVE. Returns `false` (busy) when the writer slot could
    /// not be taken within `timeout` or the first block changed since it was
    /// cached; the lock then stays SHARED on a fresh read transaction.
    pub async fn upgrade_exclusive(&mut self, timeout: Duration) -> Result<bool> {
        if self.lock != LockLevel::Shared {
            return Err(LockError::InvalidTransition {
                from: self.lock,
                to: LockLevel::Exclusive,
            }
            .into());
        }

        self.close_read_state();
        if let Some(txn) = self.txn.take() {
            txn.commit().await.context("failed to commit read transaction")?;
        }

        let handle = &self.handle;
        let attempt = tokio::time::timeout(timeout, async {
            let mut txn = handle.begin(TxnMode::ReadWrite).await?;
            let first = txn.get(0).await?;
            anyhow::Ok((txn, first))
        })
        .await;

        match attempt {
            Ok(Ok((txn, first))) => {
                if first_block_unchanged(self.cached_first_block.as_deref(), first.as_deref()) {
                    self.txn = Some(txn);
                    self.lock = LockLevel::Exclusive;
                    self.cached_first_block = first;
                    return Ok(true);
                }
                debug!("first block changed since SHARED was acquired");
                drop(txn);
                self.reopen_read().await?;
                Ok(false)
            }
            Ok(Err(err)) => {
                self.reopen_read().await?;
                Err(err.context("failed to begin read/write transaction"))
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "lock upgrade timed out");
                self.reopen_read().await?;
                Ok(false)
            }
        }
    }

    /// EXCLUSIVE -> SHARED. Commits the writes and continues on a read
    /// transaction.
    pub async fn downgrade_shared(&mut self) -> Result<()> {
        if self.lock != LockLevel::Exclusive {
            return Err(LockError::InvalidTransition {
                from: self.lock,
                to: LockLevel::Shared,
            }
            .into());
        }
        self.close_read_state();
        if let Some(txn) = self.txn.take() {
            txn.commit()
                .await
                .context("failed to commit read/write transaction")?;
        }
        self.reopen_read().await
    }

    /// -> NONE. Waits for the transaction to complete.
    pub async fn release(mut self) -> Result<()> {
        self.close_read_state();
        if let Some(txn) = self.txn.take() {
            txn.commit().await.context("failed to complete transaction")?;
        }
        Ok(())
    }

    /// Reads one block, choosing between keyed lookups and a cursor.
    pub async fn read(&mut self, key: i64, tuning: &ReadTuning) -> Result<Option<Vec<u8>>> {
        let txn = self
            .txn
            .as_mut()
            .context("transaction is no longer active")?;

        if let Some(cursor) = self.strategy.cursor_mut() {
            if cursor.accepts(key, tuning.cursor_window) {
                return cursor.read(txn, key).await;
            }
            self.strategy.reset(Some(&mut *txn));
        }

        if let Some(direction) = self.history.direction(tuning.sequential_span) {
            self.history.clear();
            let id = txn.open_cursor(key, direction).await?;
            let mut cursor = CursorState::new(id, direction, key);
            let value = cursor.read(txn, key).await?;
            debug!(key, ?direction, "switching block reads to a cursor");
            self.strategy = ReadStrategy::cursor(direction, cursor);
            return Ok(value);
        }

        self.history.push(key);
        txn.get(key).await
    }

    /// Keyed lookup outside the sequential-read bookkeeping.
    pub async fn get(&mut self, key: i64) -> Result<Option<Vec<u8>>> {
        self.txn
            .as_mut()
            .context("transaction is no longer active")?
            .get(key)
            .await
    }

    pub async fn write(&mut self, writes: Vec<(i64, Vec<u8>)>) -> Result<()> {
        self.close_read_state();
        let txn = self
            .txn
            .as_mut()
            .context("transaction is no longer active")?;
        for (key, value) in writes {
            txn.put(key, value).await?;
        }
        Ok(())
    }

    async fn reopen_read(&mut self) -> Result<()> {
        let txn = self
            .handle
            .begin(TxnMode::ReadOnly)
            .await
            .context("failed to begin read transaction")?;
        self.txn = Some(txn);
        self.lock = LockLevel::Shared;
        Ok(())
    }

    fn close_read_state(&mut self) {
        self.history.clear();
        self.strategy.reset(self.txn.as_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BlockStore, MemoryStore};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn first_block(counter: u8) -> Vec<u8> {
        let mut block = vec![0_u8; 512];
        block[24] = counter;
        block
    }

    async fn seed(store: &MemoryStore, records: Vec<(i64, Vec<u8>)>) {
        let handle = store.open("db").await.expect("open");
        let mut txn = Transaction::ad_hoc(handle, TxnMode::ReadWrite)
            .await
            .expect("begin");
        txn.write(records).await.expect("write");
        txn.release().await.expect("commit");
    }

    #[tokio::test]
    async fn shared_exclusive_shared_none() {
        let store = MemoryStore::new();
        seed(&store, vec![(0, first_block(1))]).await;
        let handle = store.open("db").await.expect("open");

        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        assert_eq!(trans.lock_level(), LockLevel::Shared);
        assert!(trans.upgrade_exclusive(TIMEOUT).await.expect("upgrade"));
        assert_eq!(trans.lock_level(), LockLevel::Exclusive);
        assert_eq!(trans.mode(), Some(TxnMode::ReadWrite));

        trans.write(vec![(1, vec![7; 512])]).await.expect("write");
        trans.downgrade_shared().await.expect("downgrade");
        assert_eq!(trans.lock_level(), LockLevel::Shared);
        assert_eq!(trans.mode(), Some(TxnMode::ReadOnly));
        assert_eq!(store.committed("db", 1), Some(vec![7; 512]));

        trans.release().await.expect("release");
    }

    #[tokio::test]
    async fn upgrade_fails_after_interleaved_writer() {
        let store = MemoryStore::new();
        seed(&store, vec![(0, first_block(1))]).await;
        let handle = store.open("db").await.expect("open");

        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        seed(&store, vec![(0, first_block(2))]).await;

        assert!(!trans.upgrade_exclusive(TIMEOUT).await.expect("upgrade"));
        assert_eq!(trans.lock_level(), LockLevel::Shared);
        assert_eq!(trans.mode(), Some(TxnMode::ReadOnly));
    }

    #[tokio::test]
    async fn upgrade_times_out_while_another_writer_is_active() {
        let store = MemoryStore::new();
        let handle = store.open("db").await.expect("open");
        let blocker = handle.begin(TxnMode::ReadWrite).await.expect("writer");

        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        assert!(!trans.upgrade_exclusive(TIMEOUT).await.expect("upgrade"));
        assert_eq!(trans.lock_level(), LockLevel::Shared);

        drop(blocker);
        assert!(trans.upgrade_exclusive(TIMEOUT).await.expect("upgrade"));
    }

    #[tokio::test]
    async fn upgrade_from_exclusive_is_a_contract_violation() {
        let store = MemoryStore::new();
        let handle = store.open("db").await.expect("open");
        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        assert!(trans.upgrade_exclusive(TIMEOUT).await.expect("upgrade"));

        let err = trans
            .upgrade_exclusive(TIMEOUT)
            .await
            .expect_err("second upgrade must fail");
        assert_eq!(
            err.downcast_ref::<LockError>(),
            Some(&LockError::InvalidTransition {
                from: LockLevel::Exclusive,
                to: LockLevel::Exclusive
            })
        );

        let mut shared = Transaction::acquire_shared(store.open("other").await.expect("open"))
            .await
            .expect("shared");
        assert!(shared.downgrade_shared().await.is_err());
    }

    #[tokio::test]
    async fn sequential_reads_switch_to_cursor_and_back() {
        let store = MemoryStore::new();
        seed(
            &store,
            (0..20).map(|key| (key, vec![key as u8; 8])).collect(),
        )
        .await;
        let handle = store.open("db").await.expect("open");
        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        let tuning = ReadTuning::default();

        for key in 1..4 {
            assert_eq!(
                trans.read(key, &tuning).await.expect("read"),
                Some(vec![key as u8; 8])
            );
            assert!(!trans.strategy().is_cursor());
        }

        assert_eq!(trans.read(4, &tuning).await.expect("read"), Some(vec![4; 8]));
        assert!(matches!(trans.strategy(), ReadStrategy::ForwardCursor(_)));
        assert_eq!(trans.read(6, &tuning).await.expect("read"), Some(vec![6; 8]));
        assert_eq!(trans.read(25, &tuning).await.expect("read"), None);
        assert!(matches!(trans.strategy(), ReadStrategy::ForwardCursor(_)));

        assert_eq!(trans.read(2, &tuning).await.expect("read"), Some(vec![2; 8]));
        assert!(!trans.strategy().is_cursor());
    }

    #[tokio::test]
    async fn backward_scan_uses_backward_cursor() {
        let store = MemoryStore::new();
        seed(&store, vec![(10, vec![10]), (8, vec![8]), (3, vec![3])]).await;
        let handle = store.open("db").await.expect("open");
        let mut trans = Transaction::acquire_shared(handle).await.expect("shared");
        let tuning = ReadTuning::default();

        for key in [12, 11, 10] {
            trans.read(key, &tuning).await.expect("read");
        }
        assert_eq!(trans.read(9, &tuning).await.expect("read"), None);
        assert!(matches!(trans.strategy(), ReadStrategy::BackwardCursor(_)));
        assert_eq!(trans.read(8, &tuning).await.expect("read"), Some(vec![8]));
        assert_eq!(trans.read(3, &tuning).await.expect("read"), Some(vec![3]));
        assert_eq!(trans.read(2, &tuning).await.expect("read"), None);
    }
}
