//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

/// Options for the ferryd daemon. Unset flags fall back to the config file,
/// then to built-in defaults.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferryd - share a directory over the ferry line protocol")]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:8080]
    #[arg(long)]
    pub bind: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds to wait for a command on an idle connection
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Seconds a transfer may stall before the connection is dropped
    #[arg(long)]
    pub io_timeout: Option<u64>,

    /// Send LIST responses unframed, for old clients
    #[arg(long)]
    pub legacy_list: bool,

    /// Append a JSON line per transfer to this file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. info, debug, ferry=trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Options for the interactive client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferry - interactive client for a ferryd server")]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: String,

    /// Directory downloads are saved to and uploads are read from
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Expect unframed LIST responses (server runs with --legacy-list)
    #[arg(long)]
    pub legacy_list: bool,

    /// Hide transfer progress bars
    #[arg(long)]
    pub quiet: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}
