//! Client-side helpers for the two external contracts: submitting one
//! `TRANSFER` to a coordinator and reading one balance from the node that
//! owns the account. One connection, one request, one reply.

use crate::errors::{MaatError, Result};
use crate::wire::{self, Message};

/// Sends one transfer to the coordinator and returns its reply, normally a
/// `TRANSFER_RESULT`.
pub async fn transfer(
    coordinator_addr: &str,
    from_node: &str,
    from_account: &str,
    to_node: &str,
    to_account: &str,
    amount: i64,
) -> Result<Message> {
    wire::roundtrip(
        coordinator_addr,
        &Message::Transfer {
            from_node: from_node.to_string(),
            from_account: from_account.to_string(),
            to_node: to_node.to_string(),
            to_account: to_account.to_string(),
            amount,
        },
    )
    .await
}

/// Reads one account's committed balance from a participant node.
pub async fn read_balance(node_addr: &str, account_id: &str) -> Result<i64> {
    match wire::roundtrip(
        node_addr,
        &Message::Read {
            account_id: account_id.to_string(),
        },
    )
    .await?
    {
        Message::ReadResult { balance, .. } => Ok(balance),
        other => Err(MaatError::Protocol(format!(
            "unexpected READ reply: {other:?}"
        ))),
    }
}
