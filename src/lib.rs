//! Maat: atomic fund transfers across a partitioned ledger of integer
//! accounts, coordinated by two-phase commit over length-framed JSON
//! messages on TCP.
//!
//! The crate ships two processes built from the same library: the
//! [`coordinator`], which sequences transfers and keeps the durable decision
//! log, and the participant [`node`], which owns a partition of accounts
//! behind per-account locks, a write-ahead log, and a snapshot file.

pub mod client;
pub mod coordinator;
pub mod errors;
pub mod node;
pub mod wire;

pub use errors::{MaatError, Result};
pub use wire::{Message, Operation};
