use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use tracing::{debug, info, trace, warn};

use super::protocol::{Request, Response, NO_META, STATUS_BUSY, STATUS_OK};
use crate::config::Config;
use crate::lock::{LockError, ReadTuning, Transaction};
use crate::store::{BlockStore, TxnMode};
use crate::types::{decode_rkyv, encode_rkyv, LockLevel, MetaRecord, META_KEY};
use crate::util::anyhow_errno;

/// Everything the worker keeps between requests: open store handles, the
/// transaction behind each held lock, and at most one lock-free transaction
/// kept alive across consecutive block reads.
pub struct WorkerState<S: BlockStore> {
    store: Arc<S>,
    tuning: ReadTuning,
    lock_timeout: Duration,
    handles: HashMap<String, S::Handle>,
    transactions: HashMap<String, Transaction<S::Handle>>,
    ad_hoc: Option<(String, Transaction<S::Handle>)>,
}

impl<S: BlockStore> WorkerState<S> {
    pub fn new(store: Arc<S>, config: &Config) -> Self {
        Self {
            store,
            tuning: config.read_tuning(),
            lock_timeout: config.lock_timeout(),
            handles: HashMap::new(),
            transactions: HashMap::new(),
            ad_hoc: None,
        }
    }

    pub fn has_ad_hoc(&self) -> bool {
        self.ad_hoc.is_some()
    }

    pub fn lock_level(&self, name: &str) -> LockLevel {
        self.transactions
            .get(name)
            .map_or(LockLevel::None, |trans| trans.lock_level())
    }

    pub async fn execute(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::ReadBlocks { name, keys } => self.read_blocks(&name, keys).await,
            Request::WriteBlocks { name, blocks } => {
                let records = blocks
                    .into_iter()
                    .map(|(key, data)| (i64::from(key), data))
                    .collect();
                self.write_records(&name, records).await?;
                Ok(Response::Status(STATUS_OK))
            }
            Request::ReadMeta { name } => self.read_meta(&name).await,
            Request::WriteMeta {
                name,
                size,
                block_size,
            } => self.write_meta(&name, size, block_size).await,
            Request::LockFile { name, level } => self.lock(&name, level).await,
            Request::UnlockFile { name, level } => self.unlock(&name, level).await,
            Request::DeleteFile { name } => self.delete(&name).await,
            Request::CloseFile { name } => self.close(&name).await,
            Request::Shutdown => Ok(Response::Status(STATUS_OK)),
        }
    }

    pub async fn close_ad_hoc(&mut self) -> Result<()> {
        if let Some((name, trans)) = self.ad_hoc.take() {
            trace!(name = %name, "closing ad-hoc read transaction");
            trans
                .release()
                .await
                .with_context(|| format!("failed to close ad-hoc transaction on {name}"))?;
        }
        Ok(())
    }

    /// Releases every transaction and forgets all handles.
    pub async fn teardown(&mut self) -> Result<()> {
        self.close_ad_hoc().await?;
        for (name, trans) in self.transactions.drain() {
            warn!(name = %name, level = %trans.lock_level(), "releasing lock at worker shutdown");
            trans
                .release()
                .await
                .with_context(|| format!("failed to release lock on {name}"))?;
        }
        self.handles.clear();
        Ok(())
    }

    async fn handle(&mut self, name: &str) -> Result<S::Handle> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = self
            .store
            .open(name)
            .await
            .with_context(|| format!("failed to open store file {name}"))?;
        debug!(name = %name, "store handle opened");
        self.handles.insert(name.to_owned(), handle.clone());
        Ok(handle)
    }

    async fn read_blocks(&mut self, name: &str, keys: Vec<i32>) -> Result<Response> {
        if !self.transactions.contains_key(name) {
            let reusable = matches!(&self.ad_hoc, Some((open, _)) if open == name);
            if !reusable {
                self.close_ad_hoc().await?;
                let handle = self.handle(name).await?;
                let trans = Transaction::ad_hoc(handle, TxnMode::ReadOnly).await?;
                self.ad_hoc = Some((name.to_owned(), trans));
            }
        }

        let tuning = self.tuning;
        let trans = match self.transactions.get_mut(name) {
            Some(trans) => trans,
            None => match self.ad_hoc.as_mut() {
                Some((_, trans)) => trans,
                None => anyhow::bail!("no transaction available to read {name}"),
            },
        };
        let mut blocks = Vec::with_capacity(keys.len());
        for key in keys {
            let data = trans
                .read(i64::from(key), &tuning)
                .await
                .with_context(|| format!("failed to read block {key} of {name}"))?;
            blocks.push((key, data.unwrap_or_default()));
        }
        Ok(Response::Blocks(blocks))
    }

    /// Writes go through the EXCLUSIVE transaction when a lock is held, or a
    /// one-shot read/write transaction when none is.
    async fn write_records(&mut self, name: &str, records: Vec<(i64, Vec<u8>)>) -> Result<()> {
        self.close_ad_hoc().await?;
        if let Some(trans) = self.transactions.get_mut(name) {
            if trans.lock_level() != LockLevel::Exclusive {
                return Err(LockError::WriteWithoutExclusive(name.to_owned()).into());
            }
            return trans
                .write(records)
                .await
                .with_context(|| format!("failed to write records of {name}"));
        }

        let handle = self.handle(name).await?;
        let mut trans = Transaction::ad_hoc(handle, TxnMode::ReadWrite).await?;
        trans
            .write(records)
            .await
            .with_context(|| format!("failed to write records of {name}"))?;
        trans.release().await
    }

    async fn read_meta(&mut self, name: &str) -> Result<Response> {
        let raw = match self.transactions.get_mut(name) {
            Some(trans) => trans.get(META_KEY).await?,
            None => {
                let handle = self.handle(name).await?;
                let mut trans = Transaction::ad_hoc(handle, TxnMode::ReadOnly).await?;
                let raw = trans.get(META_KEY).await?;
                trans.release().await?;
                raw
            }
        };
        let Some(raw) = raw else {
            return Ok(Response::Meta {
                size: NO_META,
                block_size: NO_META,
            });
        };

        let record: MetaRecord =
            decode_rkyv(&raw).with_context(|| format!("corrupt metadata record of {name}"))?;
        let size = i32::try_from(record.size).map_err(|_| {
            anyhow_errno(
                Errno::EFBIG,
                format!("size {} of {name} does not fit the wire format", record.size),
            )
        })?;
        let block_size =
            i32::try_from(record.block_size).context("stored block size out of range")?;
        Ok(Response::Meta { size, block_size })
    }

    async fn write_meta(&mut self, name: &str, size: i32, block_size: i32) -> Result<Response> {
        let record = MetaRecord {
            size: u64::try_from(size)
                .map_err(|_| anyhow_errno(Errno::EINVAL, format!("negative size {size} for {name}")))?,
            block_size: u32::try_from(block_size).map_err(|_| {
                anyhow_errno(
                    Errno::EINVAL,
                    format!("negative block size {block_size} for {name}"),
                )
            })?,
        };
        self.write_records(name, vec![(META_KEY, encode_rkyv(&record)?)])
            .await?;
        Ok(Response::Status(STATUS_OK))
    }

    async fn lock(&mut self, name: &str, level: i32) -> Result<Response> {
        let requested = LockLevel::from_i32(level)?.effective();
        let timeout = self.lock_timeout;

        if let Some(trans) = self.transactions.get_mut(name) {
            if requested <= trans.lock_level() {
                return Ok(Response::Status(STATUS_OK));
            }
            if trans.upgrade_exclusive(timeout).await? {
                debug!(name = %name, "lock upgraded to EXCLUSIVE");
                return Ok(Response::Status(STATUS_OK));
            }
            debug!(name = %name, "lock upgrade busy");
            return Ok(Response::Status(STATUS_BUSY));
        }

        match requested {
            LockLevel::None => Ok(Response::Status(STATUS_OK)),
            LockLevel::Shared => {
                let handle = self.handle(name).await?;
                match tokio::time::timeout(timeout, Transaction::acquire_shared(handle)).await {
                    Ok(trans) => {
                        let trans = trans.with_context(|| format!("failed to lock {name}"))?;
                        self.transactions.insert(name.to_owned(), trans);
                        debug!(name = %name, "SHARED lock acquired");
                        Ok(Response::Status(STATUS_OK))
                    }
                    Err(_) => {
                        warn!(
                            name = %name,
                            timeout_ms = timeout.as_millis() as u64,
                            "SHARED lock timed out"
                        );
                        Ok(Response::Status(STATUS_BUSY))
                    }
                }
            }
            other => Err(LockError::InvalidTransition {
                from: LockLevel::None,
                to: other,
            }
            .into()),
        }
    }

    async fn unlock(&mut self, name: &str, level: i32) -> Result<Response> {
        let target = LockLevel::from_i32(level)?.effective();
        match target {
            LockLevel::None => {
                if let Some(trans) = self.transactions.remove(name) {
                    trans
                        .release()
                        .await
                        .with_context(|| format!("failed to release lock on {name}"))?;
                    debug!(name = %name, "lock released");
                }
            }
            LockLevel::Shared => {
                let trans = self
                    .transactions
                    .get_mut(name)
                    .ok_or_else(|| LockError::NotHeld(name.to_owned()))?;
                if trans.lock_level() == LockLevel::Exclusive {
                    trans.downgrade_shared().await?;
                    debug!(name = %name, "lock downgraded to SHARED");
                }
            }
            _ => {
                let held = self.lock_level(name);
                if held != LockLevel::Exclusive {
                    return Err(LockError::InvalidTransition {
                        from: held,
                        to: target,
                    }
                    .into());
                }
            }
        }
        Ok(Response::Status(STATUS_OK))
    }

    async fn delete(&mut self, name: &str) -> Result<Response> {
        if let Some(trans) = self.transactions.remove(name) {
            trans.release().await?;
        }
        self.handles.remove(name);
        self.store
            .delete(name)
            .await
            .with_context(|| format!("failed to delete {name}"))?;
        info!(name = %name, "file deleted");
        Ok(Response::Status(STATUS_OK))
    }

    async fn close(&mut self, name: &str) -> Result<Response> {
        if let Some(trans) = self.transactions.remove(name) {
            warn!(name = %name, level = %trans.lock_level(), "file closed with a lock held");
            trans.release().await?;
        }
        if self.handles.remove(name).is_some() {
            debug!(name = %name, "store handle closed");
        }
        Ok(Response::Status(STATUS_OK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::util::errno_of;

    fn config() -> Config {
        Config {
            lock_timeout_ms: 50,
            ..Config::default()
        }
    }

    fn lock(name: &str, level: LockLevel) -> Request {
        Request::LockFile {
            name: name.to_owned(),
            level: level.as_i32(),
        }
    }

    fn unlock(name: &str, level: LockLevel) -> Request {
        Request::UnlockFile {
            name: name.to_owned(),
            level: level.as_i32(),
        }
    }

    fn write(name: &str, key: i32, data: Vec<u8>) -> Request {
        Request::WriteBlocks {
            name: name.to_owned(),
            blocks: vec![(key, data)],
        }
    }

    const OK: Response = Response::Status(STATUS_OK);
    const BUSY: Response = Response::Status(STATUS_BUSY);

    #[tokio::test]
    async fn meta_is_absent_until_written() {
        let store = Arc::new(MemoryStore::new());
        let mut state = WorkerState::new(Arc::clone(&store), &config());
        let read = Request::ReadMeta {
            name: "fresh.db".to_owned(),
        };

        assert_eq!(
            state.execute(read.clone()).await.expect("read"),
            Response::Meta {
                size: NO_META,
                block_size: NO_META
            }
        );
        let written = Request::WriteMeta {
            name: "fresh.db".to_owned(),
            size: 100,
            block_size: 4096,
        };
        assert_eq!(state.execute(written).await.expect("write"), OK);
        assert_eq!(
            state.execute(read).await.expect("read"),
            Response::Meta {
                size: 100,
                block_size: 4096
            }
        );
    }

    #[tokio::test]
    async fn lock_cycle_commits_on_downgrade() {
        let store = Arc::new(MemoryStore::new());
        let mut state = WorkerState::new(Arc::clone(&store), &config());

        assert_eq!(state.execute(lock("a.db", LockLevel::Shared)).await.expect("shared"), OK);
        assert_eq!(state.execute(lock("a.db", LockLevel::Reserved)).await.expect("reserved"), OK);
        assert_eq!(state.lock_level("a.db"), LockLevel::Exclusive);
        assert_eq!(state.execute(lock("a.db", LockLevel::Pending)).await.expect("pending"), OK);

        state.execute(write("a.db", 0, vec![1; 512])).await.expect("write");
        assert_eq!(store.committed("a.db", 0), None);

        state.execute(unlock("a.db", LockLevel::Shared)).await.expect("downgrade");
        assert_eq!(state.lock_level("a.db"), LockLevel::Shared);
        assert_eq!(store.committed("a.db", 0), Some(vec![1; 512]));

        state.execute(unlock("a.db", LockLevel::None)).await.expect("release");
        assert_eq!(state.lock_level("a.db"), LockLevel::None);
        assert_eq!(state.execute(unlock("a.db", LockLevel::None)).await.expect("no-op"), OK);
    }

    #[tokio::test]
    async fn contract_violations_are_errors() {
        let store = Arc::new(MemoryStore::new());
        let mut state = WorkerState::new(store, &config());

        let err = state
            .execute(lock("a.db", LockLevel::Exclusive))
            .await
            .expect_err("must enter through SHARED");
        assert!(err.downcast_ref::<LockError>().is_some(), "unexpected error: {err}");

        let err = state
            .execute(unlock("a.db", LockLevel::Shared))
            .await
            .expect_err("nothing held");
        assert_eq!(
            err.downcast_ref::<LockError>(),
            Some(&LockError::NotHeld("a.db".to_owned()))
        );

        state.execute(lock("a.db", LockLevel::Shared)).await.expect("shared");
        let err = state
            .execute(write("a.db", 0, vec![0; 512]))
            .await
            .expect_err("write under SHARED");
        assert_eq!(
            err.downcast_ref::<LockError>(),
            Some(&LockError::WriteWithoutExclusive("a.db".to_owned()))
        );

        let err = state
            .execute(Request::LockFile {
                name: "a.db".to_owned(),
                level: 9,
            })
            .await
            .expect_err("bad level");
        assert_eq!(errno_of(&err), Errno::EINVAL);
    }

    #[tokio::test]
    async fn competing_writer_makes_upgrade_busy() {
        let store = Arc::new(MemoryStore::new());
        let mut first = WorkerState::new(Arc::clone(&store), &config());
        let mut second = WorkerState::new(Arc::clone(&store), &config());

        first.execute(lock("a.db", LockLevel::Shared)).await.expect("shared");
        first.execute(lock("a.db", LockLevel::Exclusive)).await.expect("exclusive");

        assert_eq!(second.execute(lock("a.db", LockLevel::Shared)).await.expect("shared"), OK);
        assert_eq!(
            second.execute(lock("a.db", LockLevel::Exclusive)).await.expect("upgrade"),
            BUSY
        );
        assert_eq!(second.lock_level("a.db"), LockLevel::Shared);

        first.execute(unlock("a.db", LockLevel::None)).await.expect("release");
        assert_eq!(
            second.execute(lock("a.db", LockLevel::Exclusive)).await.expect("retry"),
            OK
        );
    }

    #[tokio::test]
    async fn lock_free_reads_share_one_transaction() {
        let store = Arc::new(MemoryStore::new());
        let mut state = WorkerState::new(Arc::clone(&store), &config());
        state.execute(write("a.db", 2, vec![2; 16])).await.expect("write");
        assert_eq!(store.committed("a.db", 2), Some(vec![2; 16]));

        let read = Request::ReadBlocks {
            name: "a.db".to_owned(),
            keys: vec![1, 2],
        };
        assert_eq!(
            state.execute(read.clone()).await.expect("read"),
            Response::Blocks(vec![(1, Vec::new()), (2, vec![2; 16])])
        );
        assert!(state.has_ad_hoc());
        state.execute(read).await.expect("read again");
        assert!(state.has_ad_hoc());

        state.close_ad_hoc().await.expect("close");
        assert!(!state.has_ad_hoc());
    }

    #[tokio::test]
    async fn delete_releases_and_forgets() {
        let store = Arc::new(MemoryStore::new());
        let mut state = WorkerState::new(Arc::clone(&store), &config());
        state.execute(write("a.db", 0, vec![1; 16])).await.expect("write");
        state.execute(lock("a.db", LockLevel::Shared)).await.expect("shared");

        let delete = Request::DeleteFile {
            name: "a.db".to_owned(),
        };
        assert_eq!(state.execute(delete).await.expect("delete"), OK);
        assert!(!store.contains("a.db"));
        assert_eq!(state.lock_level("a.db"), LockLevel::None);
        state.teardown().await.expect("teardown");
    }
}
