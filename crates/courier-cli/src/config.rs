//! Command line and environment configuration of `courier-fetch`.

use std::path::PathBuf;

use clap::Parser;

/// Download a file with resume support and record it in the transfer
/// history.
#[derive(Debug, Clone, Parser)]
#[command(name = "courier-fetch", version, about)]
pub struct CliConfig {
    /// URL of the file.
    pub url: String,

    /// Destination path. Partial data is kept next to it as `<output>.part`.
    pub output: PathBuf,

    /// SQLite database holding the transfer history.
    /// Env: `COURIER_DB_PATH`
    /// Default: the platform data directory.
    #[arg(long, env = "COURIER_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Account the history entry belongs to.
    /// Env: `COURIER_USER_ID`
    #[arg(long, env = "COURIER_USER_ID", default_value = "local")]
    pub user: String,

    /// Peer that shared the file.
    #[arg(long, default_value = "-")]
    pub peer: String,

    /// Size announced by the sender, used until the server reports one.
    #[arg(long)]
    pub expected_size: Option<u64>,

    /// Connection timeout in seconds.
    /// Env: `COURIER_CONNECT_TIMEOUT_SECS`
    /// Default: `30`
    #[arg(long, env = "COURIER_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,
}

impl CliConfig {
    pub fn part_path(&self) -> PathBuf {
        with_suffix(&self.output, ".part")
    }

    pub fn etag_path(&self) -> PathBuf {
        with_suffix(&self.output, ".part.etag")
    }

    /// File name recorded in the history.
    pub fn display_name(&self) -> String {
        self.output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}
