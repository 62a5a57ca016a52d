pub mod bloom;
pub mod config;
pub mod error;
pub mod lsm;
pub mod store;
pub mod txn;

#[cfg(test)]
pub mod tmpfs;

pub use config::{BloomPolicy, TreeConfig};
pub use error::{Error, Result};
pub use lsm::{CursorConfig, LsmCursor, LsmTree};
pub use store::{ChunkCursor, ChunkStore, MapStore};
pub use txn::{Session, Snapshot, TxnManager};
