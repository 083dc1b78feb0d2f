//! Synchronous block-file access over an asynchronous transactional store.
//!
//! A caller thread drives [`file::File`]s whose block I/O crosses a
//! turn-taking [`channel`] to a [`worker`] thread; the worker maps lock
//! levels onto store transactions ([`lock`]) and serves block reads and
//! writes against a [`store::BlockStore`].

pub mod channel;
pub mod config;
pub mod file;
pub mod lock;
pub mod logging;
pub mod node;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;

pub use config::Config;
pub use file::{Backend, File, FileOps};
pub use logging::{init_logging, try_init_logging};
pub use node::{Namespace, Node, NodeOps};
pub use types::{FileMeta, LockLevel, SetAttr};
pub use worker::{spawn_worker, WorkerHandle};
