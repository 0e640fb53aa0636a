use std::path::PathBuf;
use std::time::Duration;

use ahash::AHashMap as HashMap;

use crate::errors::{MaatError, Result};

/// Per-message timeout for `PREPARE`; a slow vote counts as abort.
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-message timeout for `COMMIT`/`ABORT` delivery, which may retry.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Startup configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    /// Participant node id -> `host:port` address.
    pub nodes: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub prepare_timeout: Duration,
    pub commit_timeout: Duration,
}

impl CoordinatorConfig {
    /// Parses the `id:host:port[,id:host:port...]` node map from the CLI.
    pub fn parse_nodes(spec: &str) -> Result<HashMap<String, String>> {
        let mut nodes = HashMap::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut fields = part.splitn(3, ':');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(host), Some(port)) if !id.is_empty() && !host.is_empty() => {
                    let port: u16 = port.parse().map_err(|_| {
                        MaatError::Config(format!("bad port in node entry {part:?}"))
                    })?;
                    nodes.insert(id.to_string(), format!("{host}:{port}"));
                }
                _ => {
                    return Err(MaatError::Config(format!(
                        "malformed node entry {part:?}, expected id:host:port"
                    )));
                }
            }
        }
        if nodes.is_empty() {
            return Err(MaatError::Config("empty node map".to_string()));
        }
        Ok(nodes)
    }
}
