use std::path::PathBuf;

use thiserror::Error;

/// Represents the possible errors that can occur within the Maat transfer system.
///
/// Every fallible path in the coordinator, the participant node, and the wire
/// layer reports through this enum so callers can distinguish transport
/// trouble from protocol violations and from durable-state corruption.
#[derive(Error, Debug)]
pub enum MaatError {
    /// An I/O error from a socket or from one of the durable files
    /// (snapshot, write-ahead log, decision log).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A message or persisted record could not be encoded or decoded as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer violated the framing or message contract, for example by
    /// closing the connection mid-frame or replying with an unexpected
    /// message type.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A transfer referenced a participant id that is not in the
    /// coordinator's node map.
    #[error("unknown participant node: {0}")]
    UnknownNode(String),

    /// A client request failed validation before any decision-log record
    /// was written.
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    /// Startup configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A participant's state snapshot could not be parsed. Fatal at node
    /// startup: refusing to serve beats serving wrong balances.
    #[error("corrupt state file {path}: {detail}")]
    CorruptState { path: PathBuf, detail: String },

    /// A commit-phase operation could not be applied on a participant. The
    /// remaining operations are skipped and no `commit` record is written,
    /// so the coordinator observes a delivery failure.
    #[error("commit {txid} failed: {detail}")]
    CommitFailed { txid: String, detail: String },
}

/// A convenient type alias for the standard `Result` with `MaatError` as the
/// error type.
pub type Result<T> = std::result::Result<T, MaatError>;
