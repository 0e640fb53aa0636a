//! The participant (data) node: owns one partition of accounts and serves
//! `PREPARE` / `COMMIT` / `ABORT` / `READ` for the coordinator.

pub mod server;
pub mod store;
pub mod wal;

pub use server::{run, serve, NodeConfig};
pub use store::{AccountStore, Vote};
pub use wal::{WalRecord, WriteAheadLog};
