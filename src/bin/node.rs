use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use maat::node::{self, NodeConfig};

#[derive(Debug, Parser)]
#[command(
    name = "maat-node",
    about = "Participant node: owns one partition of accounts and serves PREPARE/COMMIT/ABORT/READ"
)]
struct CliOptions {
    /// Logical node identifier, e.g. N1.
    #[arg(long)]
    node_id: String,

    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on for coordinator requests.
    #[arg(long)]
    port: u16,

    /// Directory holding the state snapshot and write-ahead log.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(FmtSubscriber::new())?;
    let options = CliOptions::parse();
    node::run(NodeConfig {
        node_id: options.node_id,
        host: options.host,
        port: options.port,
        data_dir: options.data_dir,
    })
    .await?;
    Ok(())
}
