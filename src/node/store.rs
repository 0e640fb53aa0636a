use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};

use crate::errors::{MaatError, Result};
use crate::node::wal::{WalRecord, WriteAheadLog};
use crate::wire::Operation;

/// The participant's vote in phase 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort(String),
}

/// One participant node's partition of the ledger.
///
/// Holds the committed balances, a lazily-populated table of per-account
/// locks, the write-ahead log, and the snapshot path. All balance mutations
/// happen inside the corresponding account lock; the lock table itself is a
/// concurrent skip map so creating a lock for a fresh account never blocks
/// traffic on other accounts.
///
/// Locking discipline: `prepare` acquires its locks non-blocking and drops
/// them before the vote leaves the process, so isolation spans only the
/// prepare critical section. `commit` therefore recomputes from the live
/// balances rather than trusting the prepare-time projection, and takes its
/// locks one at a time (blocking; commit critical sections are short).
pub struct AccountStore {
    node_id: String,
    balances: RwLock<HashMap<String, i64>>,
    locks: SkipMap<String, Arc<Mutex<()>>>,
    state_path: PathBuf,
    wal: WriteAheadLog,
}

impl AccountStore {
    /// Opens the node's durable state under `data_dir`, creating the
    /// directory if needed.
    ///
    /// A missing snapshot means a fresh node (empty ledger). A snapshot that
    /// exists but does not parse is fatal: starting empty over live data
    /// would un-commit funds.
    pub fn open(node_id: &str, data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let state_path = data_dir.join(format!("node_{node_id}_state.json"));
        let wal_path = data_dir.join(format!("node_{node_id}_log.jsonl"));

        let balances = if state_path.exists() {
            let raw = fs::read_to_string(&state_path)?;
            serde_json::from_str::<HashMap<String, i64>>(&raw).map_err(|err| {
                MaatError::CorruptState {
                    path: state_path.clone(),
                    detail: err.to_string(),
                }
            })?
        } else {
            HashMap::new()
        };
        tracing::info!(
            node_id,
            accounts = balances.len(),
            state = %state_path.display(),
            "loaded participant state"
        );

        let wal = WriteAheadLog::open(&wal_path)?;
        Ok(Self {
            node_id: node_id.to_string(),
            balances: RwLock::new(balances),
            locks: SkipMap::new(),
            state_path,
            wal,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// Gets (or lazily creates) the lock for one account.
    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .get_or_insert(account_id.to_string(), Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Phase 1: decide whether this node can apply `operations`.
    ///
    /// Touched accounts are locked in ascending account-id order with
    /// non-blocking acquisition; any held lock means another transaction is
    /// in its prepare or commit critical section on that account, and this
    /// one votes abort instead of waiting. Feasibility projects the deltas
    /// cumulatively onto the committed balances.
    ///
    /// Every lock taken here is released when this function returns, before
    /// the vote is written back to the coordinator.
    pub fn prepare(&self, txid: &str, operations: &[Operation]) -> Result<Vote> {
        let mut accounts: Vec<&str> = operations.iter().map(|op| op.account_id.as_str()).collect();
        accounts.sort_unstable();
        accounts.dedup();

        let locks: Vec<Arc<Mutex<()>>> = accounts
            .iter()
            .map(|account| self.account_lock(account))
            .collect();
        let mut held = Vec::with_capacity(locks.len());
        for (account, lock) in accounts.iter().zip(&locks) {
            match lock.try_lock() {
                Some(guard) => held.push(guard),
                None => {
                    let reason = format!("lock_contention_on_{account}");
                    self.wal.append(&WalRecord::PrepareFailed {
                        txid: txid.to_string(),
                        reason: reason.clone(),
                    })?;
                    return Ok(Vote::Abort(reason));
                }
            }
        }

        let mut projected: HashMap<&str, i64> = {
            let balances = self.balances.read();
            accounts
                .iter()
                .map(|account| (*account, balances.get(*account).copied().unwrap_or(0)))
                .collect()
        };
        for op in operations {
            let balance = projected
                .get_mut(op.account_id.as_str())
                .ok_or_else(|| MaatError::Protocol("operation on unlocked account".to_string()))?;
            *balance += op.delta;
            if *balance < 0 {
                self.wal.append(&WalRecord::PrepareFailed {
                    txid: txid.to_string(),
                    reason: "insufficient_balance".to_string(),
                })?;
                return Ok(Vote::Abort("insufficient_balance".to_string()));
            }
        }

        self.wal.append(&WalRecord::PrepareOk {
            txid: txid.to_string(),
            operations: operations.to_vec(),
        })?;
        Ok(Vote::Commit)
    }

    /// Phase 2: apply `operations` permanently.
    ///
    /// Repeated `COMMIT`s for a txid already holding a `commit` WAL record
    /// are acknowledged without reapplying. Each operation is applied to the
    /// live balance under its account lock: WAL update record first, then
    /// the in-memory balance, then the snapshot. An operation that would
    /// drive a balance negative fails the commit; nothing further is
    /// applied and no `commit` record is written, so the coordinator sees a
    /// delivery failure rather than a silent partial apply.
    pub fn commit(&self, txid: &str, operations: &[Operation]) -> Result<()> {
        if self.wal.has_commit(txid) {
            tracing::info!(txid, node_id = %self.node_id, "duplicate COMMIT acknowledged");
            return Ok(());
        }
        for op in operations {
            let lock = self.account_lock(&op.account_id);
            let _guard = lock.lock();
            let old_balance = self
                .balances
                .read()
                .get(&op.account_id)
                .copied()
                .unwrap_or(0);
            let new_balance = old_balance + op.delta;
            if new_balance < 0 {
                tracing::error!(
                    txid,
                    account_id = %op.account_id,
                    old_balance,
                    delta = op.delta,
                    "commit refused: balance would go negative"
                );
                return Err(MaatError::CommitFailed {
                    txid: txid.to_string(),
                    detail: format!("balance of {} would go negative", op.account_id),
                });
            }
            self.wal.append(&WalRecord::Update {
                txid: txid.to_string(),
                account_id: op.account_id.clone(),
                delta: op.delta,
                old_balance,
                new_balance,
            })?;
            self.balances
                .write()
                .insert(op.account_id.clone(), new_balance);
            self.persist_snapshot()?;
        }
        self.wal.append(&WalRecord::Commit {
            txid: txid.to_string(),
        })?;
        Ok(())
    }

    /// Records the coordinator's abort decision. Nothing to undo: prepare
    /// applied no balance change, so this is a log append and is safe for
    /// txids this node never saw.
    pub fn abort(&self, txid: &str) -> Result<()> {
        self.wal.append(&WalRecord::Abort {
            txid: txid.to_string(),
        })
    }

    /// Reads one account's committed balance under its lock. Accounts with
    /// no history read as 0.
    pub fn read(&self, account_id: &str) -> i64 {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock();
        self.balances.read().get(account_id).copied().unwrap_or(0)
    }

    /// Writes the full balance map atomically: temp file in the same
    /// directory, fsync, rename over the snapshot path.
    fn persist_snapshot(&self) -> Result<()> {
        let payload = {
            let balances = self.balances.read();
            serde_json::to_vec_pretty(&*balances)?
        };
        let tmp = self.state_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}
