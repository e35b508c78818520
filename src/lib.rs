#![deny(missing_docs)]
//! # Locker
//! A single-node, authenticated, persistent key-value server and its client.
//!
//! Each registered user carries an opaque content blob, three sliding-window
//! quotas, and access to a shared key/value store with a most-recently-used
//! listing. Clients speak a hybrid RSA+AES protocol over TCP; the server keeps
//! every mutation durable through an append-only record log that is compacted
//! into full snapshots on demand.

pub mod client;
pub mod crypto;
mod error;
pub mod funcs;
pub mod journal;
pub mod map;
pub mod mru;
pub mod net;
pub mod protocol;
pub mod quota;
pub mod server;
pub mod storage;
pub mod thread_pool;

pub use client::{LockerClient, ServerReply};
pub use error::{LockerError, Result};
pub use server::LockerServer;
pub use storage::{OpOutcome, Storage, StorageConfig};
pub use thread_pool::ThreadPool;
