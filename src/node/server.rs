use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::errors::Result;
use crate::node::store::{AccountStore, Vote};
use crate::wire::{self, Message};

/// Startup configuration for one participant node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

/// Opens the node's durable state, binds the listener, and serves forever.
/// Bind failures and corrupt state files surface as startup errors.
pub async fn run(config: NodeConfig) -> Result<()> {
    let store = Arc::new(AccountStore::open(&config.node_id, &config.data_dir)?);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(
        node_id = %config.node_id,
        addr = %listener.local_addr()?,
        "participant node listening"
    );
    serve(listener, store).await
}

/// Accept loop over an already-bound listener, one task per connection.
/// Split out from [`run`] so tests can bind ephemeral ports themselves.
pub async fn serve(listener: TcpListener, store: Arc<AccountStore>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, store).await {
                tracing::warn!(%peer, %err, "connection handler failed");
            }
        });
    }
}

/// Serves framed requests on one connection until the peer closes it. The
/// canonical client sends a single request, but long-lived connections are
/// honored too.
async fn handle_connection(mut stream: TcpStream, store: Arc<AccountStore>) -> Result<()> {
    while let Some(request) = wire::read_message_opt(&mut stream).await? {
        let reply = match request {
            Message::Prepare { txid, operations } => {
                let vote = store.prepare(&txid, &operations)?;
                tracing::info!(
                    %txid,
                    node_id = %store.node_id(),
                    ?vote,
                    "prepare processed"
                );
                match vote {
                    Vote::Commit => Message::VoteCommit { txid },
                    Vote::Abort(reason) => Message::VoteAbort { txid, reason },
                }
            }
            Message::Commit { txid, operations } => match store.commit(&txid, &operations) {
                Ok(()) => {
                    tracing::info!(%txid, node_id = %store.node_id(), "commit applied");
                    Message::Ack { txid }
                }
                Err(err) => {
                    // The coordinator treats anything but ACK as a delivery
                    // failure; the decision itself is not ours to revisit.
                    tracing::error!(%txid, %err, "commit failed");
                    Message::Error {
                        error: err.to_string(),
                    }
                }
            },
            Message::Abort { txid } => {
                store.abort(&txid)?;
                tracing::info!(%txid, node_id = %store.node_id(), "abort recorded");
                Message::Ack { txid }
            }
            Message::Read { account_id } => {
                let balance = store.read(&account_id);
                Message::ReadResult {
                    account_id,
                    balance,
                }
            }
            other => Message::Error {
                error: format!("unexpected message for participant node: {other:?}"),
            },
        };
        wire::write_message(&mut stream, &reply).await?;
    }
    Ok(())
}
