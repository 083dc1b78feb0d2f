//! The asynchronous side of the bridge. A dedicated thread runs a
//! current-thread runtime, decodes one request per iteration from the
//! argument region, executes it against the store and answers on the result
//! region.

mod client;
pub mod protocol;
mod state;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use crate::channel::{ChannelError, ChannelPair, Reader, Writer};
use crate::config::Config;
use crate::file::Backend;
use crate::store::BlockStore;
use protocol::{method, Request, Response, STATUS_ERROR, STATUS_OK};

pub use client::{ChannelFileOps, Connection};
pub use state::WorkerState;

pub struct Dispatcher<S: BlockStore> {
    reader: Reader,
    writer: Writer,
    state: WorkerState<S>,
}

impl<S: BlockStore> Dispatcher<S> {
    pub fn new(reader: Reader, writer: Writer, state: WorkerState<S>) -> Self {
        Self {
            reader,
            writer,
            state,
        }
    }

    /// Serves requests until `shutdown` or until the caller drops its end.
    /// Every decoded request is answered, handler failures included.
    pub fn run(mut self, runtime: &Runtime) -> Result<()> {
        info!("worker dispatcher started");
        while self.serve_one(runtime)? {}
        runtime.block_on(self.state.teardown())
    }

    /// Answers one request. Returns `false` once the loop should stop.
    fn serve_one(&mut self, runtime: &Runtime) -> Result<bool> {
        if self.state.has_ad_hoc() {
            let next = self.reader.peek(|reader| reader.string()).ok();
            if next.as_deref() != Some(method::READ_BLOCKS) {
                if let Err(err) = runtime.block_on(self.state.close_ad_hoc()) {
                    error!(error = %format!("{err:#}"), "failed to close ad-hoc transaction");
                }
            }
        }

        let request = match Request::read(&mut self.reader) {
            Ok(request) => request,
            Err(ChannelError::Disconnected) => {
                info!("caller disconnected, worker exiting");
                return Ok(false);
            }
            Err(ChannelError::Malformed(reason)) => {
                error!(reason = %reason, "rejecting malformed request");
                Response::Status(STATUS_ERROR)
                    .write(&mut self.writer)
                    .context("failed to answer malformed request")?;
                return Ok(true);
            }
            Err(err) => return Err(err).context("failed to read request"),
        };

        let method = request.method();
        let name = request.name().unwrap_or_default().to_owned();
        let shutdown = matches!(request, Request::Shutdown);
        debug!(method, name = %name, "handling request");

        let response = match runtime.block_on(self.state.execute(request)) {
            Ok(response) => response,
            Err(err) => {
                error!(method, name = %name, error = %format!("{err:#}"), "request failed");
                Response::Status(STATUS_ERROR)
            }
        };
        response
            .write(&mut self.writer)
            .with_context(|| format!("failed to answer {method}"))?;

        if shutdown {
            info!("shutdown requested");
        }
        Ok(!shutdown)
    }
}

/// Caller-side handle of a running worker. Hands out [`ChannelFileOps`] that
/// share its single connection.
pub struct WorkerHandle {
    conn: Arc<Mutex<Connection>>,
    thread: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Asks the worker to stop and waits for its thread.
    pub fn shutdown(self) -> Result<()> {
        let response = self.conn.lock().call(&Request::Shutdown)?;
        if response != Response::Status(STATUS_OK) {
            return Err(anyhow!("worker refused shutdown: {response:?}"));
        }
        self.thread
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))?
    }
}

impl Backend for WorkerHandle {
    type Ops = ChannelFileOps;

    fn create_file(&self, name: &str) -> ChannelFileOps {
        ChannelFileOps::new(name, Arc::clone(&self.conn))
    }
}

pub fn spawn_worker<S: BlockStore>(store: Arc<S>, config: &Config) -> Result<WorkerHandle> {
    config.validate()?;
    let channels = ChannelPair::new(config.channel_capacity_bytes);
    let (reader, writer) = channels.worker();
    let state = WorkerState::new(store, config);

    let thread = thread::Builder::new()
        .name(config.worker_thread_name.clone())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .context("failed to build worker runtime")?;
            Dispatcher::new(reader, writer, state).run(&runtime)
        })
        .context("failed to spawn worker thread")?;

    let (writer, reader) = channels.caller();
    Ok(WorkerHandle {
        conn: Arc::new(Mutex::new(Connection::new(writer, reader))),
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SharedBuffer;
    use crate::store::MemoryStore;
    use protocol::ResponseKind;

    #[test]
    fn unknown_method_gets_an_error_status() {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let args = SharedBuffer::new(config.channel_capacity_bytes);
        let results = SharedBuffer::new(config.channel_capacity_bytes);
        let dispatcher = Dispatcher::new(
            Reader::new(Arc::clone(&args)),
            Writer::new(Arc::clone(&results)),
            WorkerState::new(store, &config),
        );
        let worker = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");
            dispatcher.run(&runtime)
        });

        let mut writer = Writer::new(args);
        let mut reader = Reader::new(results);
        writer.string("truncateFile").expect("method");
        writer.string("a.db").expect("name");
        writer.int32(0).expect("size");
        writer.finalize().expect("end");
        assert_eq!(
            Response::read(&mut reader, ResponseKind::Status).expect("answer"),
            Response::Status(STATUS_ERROR)
        );

        Request::Shutdown.write(&mut writer).expect("shutdown");
        assert_eq!(
            Response::read(&mut reader, ResponseKind::Status).expect("answer"),
            Response::Status(STATUS_OK)
        );
        worker.join().expect("join").expect("dispatcher");
    }

    #[test]
    fn ad_hoc_read_is_closed_when_another_method_follows() {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let args = SharedBuffer::new(config.channel_capacity_bytes);
        let results = SharedBuffer::new(config.channel_capacity_bytes);
        let mut dispatcher = Dispatcher::new(
            Reader::new(Arc::clone(&args)),
            Writer::new(Arc::clone(&results)),
            WorkerState::new(store, &config),
        );
        let worker = thread::spawn(move || -> Result<(bool, bool)> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            dispatcher.serve_one(&runtime)?;
            let after_read = dispatcher.state.has_ad_hoc();
            dispatcher.serve_one(&runtime)?;
            let after_lock = dispatcher.state.has_ad_hoc();
            Ok((after_read, after_lock))
        });

        let mut conn = Connection::new(Writer::new(args), Reader::new(results));
        let read = conn
            .call(&Request::ReadBlocks {
                name: "a.db".to_owned(),
                keys: vec![0],
            })
            .expect("read");
        assert_eq!(read, Response::Blocks(vec![(0, Vec::new())]));
        let lock = conn
            .call(&Request::LockFile {
                name: "a.db".to_owned(),
                level: 1,
            })
            .expect("lock");
        assert_eq!(lock, Response::Status(STATUS_OK));

        let (after_read, after_lock) = worker.join().expect("join").expect("dispatcher");
        assert!(after_read, "lock-free read should leave its transaction open");
        assert!(!after_lock, "the next method should close the lock-free transaction");
    }

    #[test]
    fn handler_errors_are_answered_and_dropping_the_caller_stops_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_worker(store, &Config::default()).expect("spawn");
        let response = handle
            .conn
            .lock()
            .call(&Request::UnlockFile {
                name: "a.db".to_owned(),
                level: 1,
            })
            .expect("call");
        assert_eq!(response, Response::Status(STATUS_ERROR));

        let WorkerHandle { conn, thread } = handle;
        drop(conn);
        thread.join().expect("join").expect("clean exit");
    }
}
