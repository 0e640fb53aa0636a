use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::wire::Operation;

/// The operations of one transaction grouped per participant node id.
pub type NodeOps = HashMap<String, Vec<Operation>>;

/// A 2PC phase marker in the decision log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxPhase {
    Start,
    Prepare,
    Commit,
    Abort,
    Complete,
}

/// One line of the coordinator's durable decision log.
///
/// `node_ops` is carried on `START` so recovery can re-address the involved
/// participants; `status` annotates outcomes (`all_voted_commit`,
/// `vote_abort`, `committed`, `aborted`, recovery variants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxLogRecord {
    pub txid: String,
    pub phase: TxPhase,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ops: Option<NodeOps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TxLogRecord {
    pub fn new(txid: &str, phase: TxPhase) -> Self {
        Self {
            txid: txid.to_string(),
            phase,
            timestamp: now_ts(),
            node_ops: None,
            status: None,
        }
    }

    pub fn with_node_ops(mut self, node_ops: NodeOps) -> Self {
        self.node_ops = Some(node_ops);
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Append-only decision log, one JSON record per line, fsync'd per append.
///
/// The append happens before the outward-visible effect of the phase it
/// records: `START` before any `PREPARE` is sent, the decision before the
/// outcome is delivered, `COMPLETE` after deliveries were attempted.
pub struct TxLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TxLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &TxLogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads every record back in log order. Lines that fail to parse are
    /// skipped with a warning rather than poisoning recovery.
    pub fn scan(&self) -> Result<Vec<TxLogRecord>> {
        let mut records = Vec::new();
        let reader = BufReader::new(File::open(&self.path)?);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TxLogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        %err,
                        "skipping unreadable decision log line"
                    );
                }
            }
        }
        Ok(records)
    }
}
