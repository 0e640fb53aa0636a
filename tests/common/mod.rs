//! Shared harness for the integration tests: an in-process cluster of
//! participant nodes plus a coordinator, each serving real TCP on an
//! ephemeral loopback port, with durable state under a per-test tempdir.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use maat::coordinator::{Coordinator, CoordinatorConfig, TxLogRecord};
use maat::node::{AccountStore, WalRecord};
use maat::wire::{Message, Operation};

pub fn op(account_id: &str, delta: i64) -> Operation {
    Operation {
        account_id: account_id.to_string(),
        delta,
    }
}

/// Writes a node's snapshot file directly, before the node first starts.
pub fn seed_balances(data_dir: &Path, node_id: &str, balances: &[(&str, i64)]) {
    std::fs::create_dir_all(data_dir).unwrap();
    let map: std::collections::HashMap<&str, i64> = balances.iter().copied().collect();
    std::fs::write(
        data_dir.join(format!("node_{node_id}_state.json")),
        serde_json::to_vec_pretty(&map).unwrap(),
    )
    .unwrap();
}

pub struct TestNode {
    pub node_id: String,
    pub addr: String,
    pub store: Arc<AccountStore>,
    handle: JoinHandle<()>,
}

impl TestNode {
    /// Kills the server task without any shutdown courtesy, simulating a
    /// participant crash. Durable state stays on disk for a respawn.
    pub fn crash(&self) {
        self.handle.abort();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_node(node_id: &str, data_dir: &Path) -> TestNode {
    let store = Arc::new(AccountStore::open(node_id, data_dir).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_store = Arc::clone(&store);
    let handle = tokio::spawn(async move {
        let _ = maat::node::serve(listener, server_store).await;
    });
    TestNode {
        node_id: node_id.to_string(),
        addr,
        store,
        handle,
    }
}

pub fn coordinator_config(data_dir: &Path, nodes: AHashMap<String, String>) -> CoordinatorConfig {
    CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        nodes,
        data_dir: data_dir.to_path_buf(),
        prepare_timeout: Duration::from_secs(5),
        commit_timeout: Duration::from_secs(5),
    }
}

pub struct TestCoordinator {
    pub coordinator: Arc<Coordinator>,
    pub addr: String,
    handle: JoinHandle<()>,
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs recovery, then serves on an ephemeral port.
pub async fn spawn_coordinator(
    data_dir: &Path,
    nodes: AHashMap<String, String>,
) -> TestCoordinator {
    let coordinator = Arc::new(Coordinator::new(coordinator_config(data_dir, nodes)).unwrap());
    coordinator.recover().await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move {
        let _ = maat::coordinator::serve(listener, serving).await;
    });
    TestCoordinator {
        coordinator,
        addr,
        handle,
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub coordinator: TestCoordinator,
    // Declared last so the servers shut down before the directory goes away.
    pub dir: TempDir,
}

/// Spawns one node per `(node_id, balances)` seed plus a coordinator wired
/// to all of them.
pub async fn spawn_cluster(seeds: &[(&str, &[(&str, i64)])]) -> TestCluster {
    let dir = TempDir::new().unwrap();
    let mut nodes = Vec::new();
    let mut node_map = AHashMap::new();
    for (node_id, balances) in seeds {
        seed_balances(dir.path(), node_id, balances);
        let node = spawn_node(node_id, dir.path()).await;
        node_map.insert(node_id.to_string(), node.addr.clone());
        nodes.push(node);
    }
    let coordinator = spawn_coordinator(dir.path(), node_map).await;
    TestCluster {
        nodes,
        coordinator,
        dir,
    }
}

impl TestCluster {
    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn node_addr(&self, node_id: &str) -> &str {
        &self
            .nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .expect("unknown test node")
            .addr
    }

    pub async fn transfer(
        &self,
        from_node: &str,
        from_account: &str,
        to_node: &str,
        to_account: &str,
        amount: i64,
    ) -> Message {
        maat::client::transfer(
            &self.coordinator.addr,
            from_node,
            from_account,
            to_node,
            to_account,
            amount,
        )
        .await
        .unwrap()
    }

    /// Retries transfers that lost the non-blocking lock race until a real
    /// decision (commit, or an abort for any other reason) comes back.
    pub async fn transfer_until_decided(
        &self,
        from_node: &str,
        from_account: &str,
        to_node: &str,
        to_account: &str,
        amount: i64,
    ) -> Message {
        for _ in 0..100 {
            let reply = self
                .transfer(from_node, from_account, to_node, to_account, amount)
                .await;
            if let Message::TransferResult {
                success: false,
                reason: Some(reason),
                ..
            } = &reply
            {
                if reason.starts_with("lock_contention_on_") {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
            }
            return reply;
        }
        panic!("transfer kept losing the lock race");
    }

    pub async fn balance(&self, node_id: &str, account_id: &str) -> i64 {
        maat::client::read_balance(self.node_addr(node_id), account_id)
            .await
            .unwrap()
    }

    pub fn wal_records(&self, node_id: &str) -> Vec<WalRecord> {
        read_wal(self.data_dir(), node_id)
    }

    pub fn txlog_records(&self) -> Vec<TxLogRecord> {
        read_txlog(self.data_dir())
    }
}

pub fn read_wal(data_dir: &Path, node_id: &str) -> Vec<WalRecord> {
    read_jsonl(&data_dir.join(format!("node_{node_id}_log.jsonl")))
}

pub fn read_txlog(data_dir: &Path) -> Vec<TxLogRecord> {
    read_jsonl(&data_dir.join("coordinator_tx_log.jsonl"))
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Vec<T> {
    let raw = std::fs::read_to_string(path).unwrap_or_default();
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Unpacks a `TRANSFER_RESULT`, panicking on any other reply.
pub fn result_fields(message: &Message) -> (bool, String, Option<String>) {
    match message {
        Message::TransferResult {
            success,
            txid,
            reason,
        } => (*success, txid.clone(), reason.clone()),
        other => panic!("expected TRANSFER_RESULT, got {other:?}"),
    }
}
