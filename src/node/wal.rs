use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::wire::Operation;

/// One record in a participant's write-ahead log, discriminated by the
/// `action` field. The log is append-only JSON-per-line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WalRecord {
    /// The node voted commit for `txid` after locking and feasibility checks.
    PrepareOk {
        txid: String,
        operations: Vec<Operation>,
    },
    /// The node voted abort; `reason` is `insufficient_balance` or
    /// `lock_contention_on_<account_id>`.
    PrepareFailed { txid: String, reason: String },
    /// A committed balance change, written before the in-memory apply.
    Update {
        txid: String,
        account_id: String,
        delta: i64,
        old_balance: i64,
        new_balance: i64,
    },
    /// All of `txid`'s operations on this node are applied and durable.
    Commit { txid: String },
    /// The coordinator decided abort; nothing was applied here.
    Abort { txid: String },
}

impl WalRecord {
    pub fn txid(&self) -> &str {
        match self {
            WalRecord::PrepareOk { txid, .. }
            | WalRecord::PrepareFailed { txid, .. }
            | WalRecord::Update { txid, .. }
            | WalRecord::Commit { txid }
            | WalRecord::Abort { txid } => txid,
        }
    }
}

/// Append-only write-ahead log for one participant node.
///
/// Appends are serialized by a file-level mutex and fsync'd so a record is
/// durable before the action it describes becomes visible to the
/// coordinator. The balances themselves are recovered from the snapshot,
/// not replayed from here; the log is scanned at startup only to rebuild
/// the set of committed txids, which backs `COMMIT` dedupe.
pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<File>,
    committed: Mutex<HashSet<String>>,
}

impl WriteAheadLog {
    /// Opens (or creates) the log at `path` and scans existing records for
    /// `commit` entries. Unreadable lines are skipped with a warning.
    pub fn open(path: &Path) -> Result<Self> {
        let mut committed = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalRecord>(&line) {
                    Ok(WalRecord::Commit { txid }) => {
                        committed.insert(txid);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            %err,
                            "skipping unreadable WAL line"
                        );
                    }
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            committed: Mutex::new(committed),
        })
    }

    /// Appends one record and fsyncs it.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        {
            let mut file = self.file.lock();
            file.write_all(&line)?;
            file.sync_data()?;
        }
        if let WalRecord::Commit { txid } = record {
            self.committed.lock().insert(txid.clone());
        }
        Ok(())
    }

    /// Whether a `commit` record for `txid` has ever been written here.
    pub fn has_commit(&self, txid: &str) -> bool {
        self.committed.lock().contains(txid)
    }

    /// Reads every parseable record back, in log order. Diagnostic surface;
    /// the serving path never calls this.
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<WalRecord>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
