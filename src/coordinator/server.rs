use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::coordinator::{Coordinator, CoordinatorConfig, TransferRequest};
use crate::errors::{MaatError, Result};
use crate::wire::{self, Message};

/// Builds the coordinator, runs decision-log recovery, binds, and serves
/// forever. A bind failure is a fatal startup error.
pub async fn run(config: CoordinatorConfig) -> Result<()> {
    let bind_addr = (config.host.clone(), config.port);
    let coordinator = Arc::new(Coordinator::new(config)?);
    coordinator.recover().await?;
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "coordinator listening");
    serve(listener, coordinator).await
}

/// Accept loop over an already-bound listener, one task per client
/// connection. Split out from [`run`] so tests can bind ephemeral ports.
pub async fn serve(listener: TcpListener, coordinator: Arc<Coordinator>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, coordinator).await {
                tracing::warn!(%peer, %err, "client connection failed");
            }
        });
    }
}

/// One request, one reply, close: the canonical client exchange.
async fn handle_client(mut stream: TcpStream, coordinator: Arc<Coordinator>) -> Result<()> {
    let request = match wire::read_message_opt(&mut stream).await {
        Ok(None) => return Ok(()),
        Ok(Some(message)) => message,
        Err(MaatError::Json(err)) => {
            // Undecodable frame: a malformed or incomplete TRANSFER. Reject
            // without writing any decision-log record.
            tracing::info!(%err, "rejecting undecodable client request");
            let reply = Message::TransferResult {
                success: false,
                txid: Uuid::new_v4().to_string(),
                reason: Some("invalid_request".to_string()),
            };
            wire::write_message(&mut stream, &reply).await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let reply = match request {
        Message::Transfer {
            from_node,
            from_account,
            to_node,
            to_account,
            amount,
        } => {
            let request = TransferRequest {
                from_node,
                from_account,
                to_node,
                to_account,
                amount,
            };
            match coordinator.transfer(request).await {
                Ok(outcome) => outcome.into_message(),
                Err(err) => {
                    tracing::error!(%err, "transfer failed inside the coordinator");
                    Message::Error {
                        error: err.to_string(),
                    }
                }
            }
        }
        other => Message::Error {
            error: format!("unexpected message for coordinator: {other:?}"),
        },
    };

    // A client that hung up early does not undo the transaction; the reply
    // is simply discarded.
    if let Err(err) = wire::write_message(&mut stream, &reply).await {
        tracing::debug!(%err, "client went away before the reply");
    }
    Ok(())
}
