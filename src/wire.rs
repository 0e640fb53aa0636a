use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::{MaatError, Result};

/// Upper bound on a single frame's payload. A transfer touches at most two
/// accounts, so any frame near this size is garbage or an attack.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// A single balance mutation on one account, as carried inside `PREPARE` and
/// `COMMIT` messages and inside WAL / decision-log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub account_id: String,
    pub delta: i64,
}

/// Every message exchanged over TCP, discriminated by the `type` field.
///
/// The JSON field names and `type` values are the external contract (client,
/// coordinator, and participant implementations must interoperate on them),
/// so variants carry explicit renames rather than relying on a rename rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client -> coordinator: move `amount` from one account to another.
    #[serde(rename = "TRANSFER")]
    Transfer {
        from_node: String,
        from_account: String,
        to_node: String,
        to_account: String,
        amount: i64,
    },
    /// Coordinator -> client: final outcome of a transfer.
    #[serde(rename = "TRANSFER_RESULT")]
    TransferResult {
        success: bool,
        txid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Coordinator -> participant: phase 1 vote request.
    #[serde(rename = "PREPARE")]
    Prepare {
        txid: String,
        operations: Vec<Operation>,
    },
    #[serde(rename = "VOTE_COMMIT")]
    VoteCommit { txid: String },
    #[serde(rename = "VOTE_ABORT")]
    VoteAbort { txid: String, reason: String },
    /// Coordinator -> participant: phase 2 commit decision.
    #[serde(rename = "COMMIT")]
    Commit {
        txid: String,
        operations: Vec<Operation>,
    },
    /// Coordinator -> participant: phase 2 abort decision.
    #[serde(rename = "ABORT")]
    Abort { txid: String },
    #[serde(rename = "ACK")]
    Ack { txid: String },
    /// Read one account's committed balance from the node that owns it.
    #[serde(rename = "READ")]
    Read { account_id: String },
    #[serde(rename = "READ_RESULT")]
    ReadResult { account_id: String, balance: i64 },
    /// Reply to a request the receiver could not decode or serve.
    #[serde(rename = "ERROR")]
    Error { error: String },
}

/// Writes one length-framed message: a 4-byte unsigned big-endian payload
/// length followed by the payload, a UTF-8 JSON object.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MaatError::Protocol(format!("frame of {} bytes too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message, or `None` if the peer closed the connection
/// before sending a length prefix.
///
/// EOF after a complete length prefix is a mid-frame close and therefore a
/// transport error, not a clean shutdown.
pub async fn read_message_opt<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MaatError::Protocol(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                MaatError::Protocol("connection closed mid-frame".to_string())
            }
            _ => MaatError::Io(err),
        })?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Reads one framed message, treating a clean close as a protocol error.
/// Used where the caller is still owed a reply.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    read_message_opt(reader)
        .await?
        .ok_or_else(|| MaatError::Protocol("connection closed before reply".to_string()))
}

/// One-shot request: connect to `addr`, send `message`, read a single reply,
/// and drop the connection. This is the canonical short-lived connection
/// pattern used by the coordinator's participant fan-out and by clients.
pub async fn roundtrip(addr: &str, message: &Message) -> Result<Message> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, message).await?;
    read_message(&mut stream).await
}
