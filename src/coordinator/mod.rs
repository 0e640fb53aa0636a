//! The transaction coordinator: accepts client transfers, sequences each one
//! through two-phase commit across the participant nodes, and recovers
//! in-flight transactions from its decision log on restart. The coordinator
//! stores no account data itself.

pub mod config;
pub mod server;
pub mod txlog;

pub use config::CoordinatorConfig;
pub use server::{run, serve};
pub use txlog::{NodeOps, TxLog, TxLogRecord, TxPhase};

use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::{MaatError, Result};
use crate::wire::{self, Message, Operation};

const COMMIT_DELIVERY_ATTEMPTS: u32 = 4;
const ABORT_DELIVERY_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// A validated-or-not client transfer, as decoded from a `TRANSFER` message.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from_node: String,
    pub from_account: String,
    pub to_node: String,
    pub to_account: String,
    pub amount: i64,
}

/// The final word to the client. `success: true` means the commit decision
/// is durably logged; balances reflect it at every participant that has
/// received (or will receive, via retry/recovery) the COMMIT.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub success: bool,
    pub txid: String,
    pub reason: Option<String>,
}

impl TransferOutcome {
    pub fn into_message(self) -> Message {
        Message::TransferResult {
            success: self.success,
            txid: self.txid,
            reason: self.reason,
        }
    }
}

/// One participant's phase-1 answer, with transport trouble kept distinct
/// from an explicit abort vote so the client sees the most useful reason.
#[derive(Debug)]
enum VoteResult {
    Commit,
    Abort(String),
    Failed(String),
}

pub struct Coordinator {
    config: CoordinatorConfig,
    txlog: TxLog,
    /// Transactions with a decision-log record but no terminal `COMPLETE`.
    active: Mutex<HashMap<String, TxLogRecord>>,
}

impl Coordinator {
    /// Opens the decision log under `config.data_dir`. Call [`recover`]
    /// before serving; the split keeps construction synchronous.
    ///
    /// [`recover`]: Coordinator::recover
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let txlog = TxLog::open(&config.data_dir.join("coordinator_tx_log.jsonl"))?;
        Ok(Self {
            config,
            txlog,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Appends a phase record and mirrors it into the active-transaction
    /// map, exactly like the durable log: terminal records clear the entry.
    fn log_phase(&self, record: TxLogRecord) -> Result<()> {
        self.txlog.append(&record)?;
        let mut active = self.active.lock();
        match record.phase {
            TxPhase::Start | TxPhase::Prepare | TxPhase::Commit => {
                active.insert(record.txid.clone(), record);
            }
            TxPhase::Abort | TxPhase::Complete => {
                active.remove(&record.txid);
            }
        }
        Ok(())
    }

    fn validate(&self, request: &TransferRequest) -> Result<()> {
        if request.amount <= 0 {
            return Err(MaatError::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        for node in [&request.from_node, &request.to_node] {
            if !self.config.nodes.contains_key(node.as_str()) {
                return Err(MaatError::UnknownNode(node.clone()));
            }
        }
        if request.from_node == request.to_node && request.from_account == request.to_account {
            return Err(MaatError::InvalidRequest(
                "transfer from an account to itself".to_string(),
            ));
        }
        Ok(())
    }

    /// One debit on the source node, one credit on the destination node;
    /// a same-node transfer groups both under that node.
    fn group_operations(request: &TransferRequest) -> NodeOps {
        let mut node_ops = NodeOps::default();
        node_ops
            .entry(request.from_node.clone())
            .or_default()
            .push(Operation {
                account_id: request.from_account.clone(),
                delta: -request.amount,
            });
        node_ops
            .entry(request.to_node.clone())
            .or_default()
            .push(Operation {
                account_id: request.to_account.clone(),
                delta: request.amount,
            });
        node_ops
    }

    /// Runs one transfer through the full 2PC cycle.
    ///
    /// Rejected requests write no decision-log record. Otherwise the log
    /// order is `START`, `PREPARE`, the decision, `COMPLETE`, each record
    /// durable before its phase takes outward effect. The commit decision is
    /// authoritative once logged: delivery failures are retried and then
    /// logged as inconsistencies, and the client still sees `success=true`.
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome> {
        let txid = Uuid::new_v4().to_string();
        if let Err(err) = self.validate(&request) {
            tracing::info!(%txid, %err, "transfer rejected");
            return Ok(TransferOutcome {
                success: false,
                txid,
                reason: Some("invalid_request".to_string()),
            });
        }
        tracing::info!(
            %txid,
            from_node = %request.from_node,
            from_account = %request.from_account,
            to_node = %request.to_node,
            to_account = %request.to_account,
            amount = request.amount,
            "starting transaction"
        );

        let node_ops = Self::group_operations(&request);
        self.log_phase(TxLogRecord::new(&txid, TxPhase::Start).with_node_ops(node_ops.clone()))?;
        self.log_phase(TxLogRecord::new(&txid, TxPhase::Prepare))?;

        let votes = self.gather_votes(&txid, &node_ops).await;
        let all_commit = votes
            .iter()
            .all(|(_, vote)| matches!(vote, VoteResult::Commit));

        if all_commit {
            tracing::info!(%txid, "all nodes voted commit");
            self.log_phase(TxLogRecord::new(&txid, TxPhase::Commit).with_status("all_voted_commit"))?;
            self.deliver_commits(&txid, &node_ops).await;
            self.log_phase(TxLogRecord::new(&txid, TxPhase::Complete).with_status("committed"))?;
            Ok(TransferOutcome {
                success: true,
                txid,
                reason: None,
            })
        } else {
            // Prefer a reason a participant actually voted over a
            // transport-shaped one.
            let mut reason = None;
            for (_, vote) in &votes {
                match vote {
                    VoteResult::Abort(r) => {
                        reason = Some(r.clone());
                        break;
                    }
                    VoteResult::Failed(r) if reason.is_none() => reason = Some(r.clone()),
                    _ => {}
                }
            }
            tracing::info!(%txid, ?reason, "at least one node did not vote commit; aborting");
            self.log_phase(TxLogRecord::new(&txid, TxPhase::Abort).with_status("vote_abort"))?;
            self.deliver_aborts(&txid, &node_ops).await;
            self.log_phase(TxLogRecord::new(&txid, TxPhase::Complete).with_status("aborted"))?;
            Ok(TransferOutcome {
                success: false,
                txid,
                reason,
            })
        }
    }

    /// Phase 1 fan-out: `PREPARE` to every involved node in parallel, each
    /// under the prepare timeout. A non-response is indistinguishable from
    /// a vote to abort.
    async fn gather_votes(&self, txid: &str, node_ops: &NodeOps) -> Vec<(String, VoteResult)> {
        let prepares = node_ops.iter().map(|(node_id, operations)| {
            let addr = self.config.nodes.get(node_id.as_str()).cloned();
            let message = Message::Prepare {
                txid: txid.to_string(),
                operations: operations.clone(),
            };
            let timeout = self.config.prepare_timeout;
            let node_id = node_id.clone();
            async move {
                let vote = match addr {
                    None => VoteResult::Failed("node missing from the node map".to_string()),
                    Some(addr) => {
                        match tokio::time::timeout(timeout, wire::roundtrip(&addr, &message)).await
                        {
                            Ok(Ok(Message::VoteCommit { .. })) => VoteResult::Commit,
                            Ok(Ok(Message::VoteAbort { reason, .. })) => VoteResult::Abort(reason),
                            Ok(Ok(other)) => {
                                VoteResult::Failed(format!("unexpected reply {other:?}"))
                            }
                            Ok(Err(err)) => VoteResult::Failed(format!("node_unreachable: {err}")),
                            Err(_) => VoteResult::Failed("prepare_timeout".to_string()),
                        }
                    }
                };
                tracing::info!(txid, %node_id, ?vote, "vote gathered");
                (node_id, vote)
            }
        });
        join_all(prepares).await
    }

    /// Phase 2 commit delivery to all nodes in parallel. Must reach every
    /// node that voted commit; see [`deliver_commit`](Self::deliver_commit).
    async fn deliver_commits(&self, txid: &str, node_ops: &NodeOps) {
        join_all(
            node_ops
                .iter()
                .map(|(node_id, operations)| self.deliver_commit(node_id, txid, operations)),
        )
        .await;
    }

    /// Delivers one `COMMIT` with bounded backoff. On retry exhaustion the
    /// decision remains committed; the node stays prepared and the
    /// inconsistency is logged for reconciliation.
    async fn deliver_commit(&self, node_id: &str, txid: &str, operations: &[Operation]) {
        let Some(addr) = self.config.nodes.get(node_id) else {
            tracing::error!(txid, node_id, "COMMIT delivery to a node missing from the node map");
            return;
        };
        let message = Message::Commit {
            txid: txid.to_string(),
            operations: operations.to_vec(),
        };
        let mut backoff = RETRY_BACKOFF_BASE;
        for attempt in 1..=COMMIT_DELIVERY_ATTEMPTS {
            match tokio::time::timeout(self.config.commit_timeout, wire::roundtrip(addr, &message))
                .await
            {
                Ok(Ok(Message::Ack { .. })) => {
                    tracing::info!(txid, node_id, "COMMIT delivered");
                    return;
                }
                Ok(Ok(other)) => {
                    tracing::warn!(txid, node_id, attempt, ?other, "unexpected COMMIT reply")
                }
                Ok(Err(err)) => tracing::warn!(txid, node_id, attempt, %err, "COMMIT delivery failed"),
                Err(_) => tracing::warn!(txid, node_id, attempt, "COMMIT delivery timed out"),
            }
            if attempt < COMMIT_DELIVERY_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        tracing::error!(
            txid,
            node_id,
            "COMMIT delivery exhausted retries; decision remains committed, node left prepared"
        );
    }

    /// Best-effort abort delivery. Nodes that never heard the PREPARE treat
    /// ABORT as a no-op, so undelivered aborts cost nothing but a log line.
    async fn deliver_aborts(&self, txid: &str, node_ops: &NodeOps) {
        join_all(node_ops.keys().map(|node_id| async move {
            let Some(addr) = self.config.nodes.get(node_id.as_str()) else {
                tracing::warn!(txid, %node_id, "ABORT delivery to a node missing from the node map");
                return;
            };
            let message = Message::Abort {
                txid: txid.to_string(),
            };
            for attempt in 1..=ABORT_DELIVERY_ATTEMPTS {
                match tokio::time::timeout(self.config.commit_timeout, wire::roundtrip(addr, &message))
                    .await
                {
                    Ok(Ok(Message::Ack { .. })) => return,
                    Ok(Ok(other)) => {
                        tracing::warn!(txid, %node_id, attempt, ?other, "unexpected ABORT reply")
                    }
                    Ok(Err(err)) => tracing::warn!(txid, %node_id, attempt, %err, "ABORT delivery failed"),
                    Err(_) => tracing::warn!(txid, %node_id, attempt, "ABORT delivery timed out"),
                }
                if attempt < ABORT_DELIVERY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF_BASE).await;
                }
            }
        }))
        .await;
    }

    /// Startup recovery: every transaction in the decision log without a
    /// terminal `COMPLETE` is finished now. A transaction whose latest
    /// record is the `COMMIT` decision is re-committed (participant COMMIT
    /// handling is idempotent); everything else is aborted so no node stays
    /// uncertain.
    pub async fn recover(&self) -> Result<()> {
        struct PendingTx {
            phase: TxPhase,
            node_ops: NodeOps,
        }

        let mut pending: HashMap<String, PendingTx> = HashMap::new();
        for record in self.txlog.scan()? {
            match record.phase {
                TxPhase::Complete => {
                    pending.remove(&record.txid);
                }
                phase => {
                    let entry = pending.entry(record.txid).or_insert_with(|| PendingTx {
                        phase,
                        node_ops: NodeOps::default(),
                    });
                    entry.phase = phase;
                    if let Some(node_ops) = record.node_ops {
                        entry.node_ops = node_ops;
                    }
                }
            }
        }

        if pending.is_empty() {
            tracing::info!("no incomplete transactions found; decision log is consistent");
            return Ok(());
        }
        tracing::warn!(
            count = pending.len(),
            "finishing incomplete transactions from previous run"
        );
        for (txid, tx) in pending {
            match tx.phase {
                TxPhase::Commit => {
                    tracing::info!(%txid, "recovery: re-sending COMMIT for decided transaction");
                    self.deliver_commits(&txid, &tx.node_ops).await;
                    self.log_phase(
                        TxLogRecord::new(&txid, TxPhase::Complete)
                            .with_status("committed_during_recovery"),
                    )?;
                }
                _ => {
                    tracing::info!(%txid, "recovery: aborting in-flight transaction");
                    self.deliver_aborts(&txid, &tx.node_ops).await;
                    self.log_phase(TxLogRecord::new(&txid, TxPhase::Abort).with_status("recovered"))?;
                    self.log_phase(
                        TxLogRecord::new(&txid, TxPhase::Complete)
                            .with_status("aborted_during_recovery"),
                    )?;
                }
            }
        }
        Ok(())
    }
}
