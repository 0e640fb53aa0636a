use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use maat::coordinator::{self, CoordinatorConfig};

#[derive(Debug, Parser)]
#[command(
    name = "maat-coordinator",
    about = "Transaction coordinator: sequences transfers across the participant nodes via two-phase commit"
)]
struct CliOptions {
    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on for client TRANSFER requests.
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Comma-separated participant map, id:host:port entries.
    #[arg(
        long,
        default_value = "N1:127.0.0.1:6001,N2:127.0.0.1:6002,N3:127.0.0.1:6003"
    )]
    nodes: String,

    /// Directory holding the decision log.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Seconds to wait for each PREPARE vote.
    #[arg(long, default_value_t = 5.0)]
    prepare_timeout: f64,

    /// Seconds to wait for each COMMIT/ABORT delivery attempt.
    #[arg(long, default_value_t = 15.0)]
    commit_timeout: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(FmtSubscriber::new())?;
    let options = CliOptions::parse();
    let config = CoordinatorConfig {
        host: options.host,
        port: options.port,
        nodes: CoordinatorConfig::parse_nodes(&options.nodes)?,
        data_dir: options.data_dir,
        prepare_timeout: Duration::from_secs_f64(options.prepare_timeout),
        commit_timeout: Duration::from_secs_f64(options.commit_timeout),
    };
    coordinator::run(config).await?;
    Ok(())
}
