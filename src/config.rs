//! Daemon configuration: defaults, optional TOML file, then CLI flags.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::DaemonOpts;
use crate::protocol::{self, timeouts};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Shared directory served to clients
    pub root: PathBuf,
    /// Listen address (host:port)
    pub bind: String,
    /// Listen queue length
    pub backlog: u32,
    /// Concurrent connections admitted; extra peers get `ERROR Server busy`
    pub max_connections: usize,
    /// Seconds to wait for the next command before dropping the peer
    pub idle_timeout_secs: u64,
    /// Seconds a single read/write may stall mid-transfer
    pub io_timeout_secs: u64,
    /// Bytes per read/write when streaming file bodies
    pub chunk_size: usize,
    /// Send LIST bodies without the LISTSIZE header
    pub legacy_list: bool,
    /// JSONL transfer log
    pub audit_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            bind: format!("0.0.0.0:{}", protocol::DEFAULT_PORT),
            backlog: protocol::DEFAULT_BACKLOG,
            max_connections: protocol::DEFAULT_MAX_CONNECTIONS,
            idle_timeout_secs: timeouts::IDLE_SECS,
            io_timeout_secs: timeouts::IO_SECS,
            chunk_size: protocol::CHUNK_SIZE,
            legacy_list: false,
            audit_log: None,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        toml::from_str(data).context("parse config")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    /// Defaults, overlaid by `--config` if given, overlaid by explicit flags.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut cfg = match &opts.config {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        if let Some(root) = &opts.root {
            cfg.root = root.clone();
        }
        if let Some(bind) = &opts.bind {
            cfg.bind = bind.clone();
        }
        if let Some(n) = opts.backlog {
            cfg.backlog = n;
        }
        if let Some(n) = opts.max_connections {
            cfg.max_connections = n;
        }
        if let Some(s) = opts.idle_timeout {
            cfg.idle_timeout_secs = s;
        }
        if let Some(s) = opts.io_timeout {
            cfg.io_timeout_secs = s;
        }
        if opts.legacy_list {
            cfg.legacy_list = true;
        }
        if let Some(p) = &opts.audit_log {
            cfg.audit_log = Some(p.clone());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.idle_timeout_secs == 0 || self.io_timeout_secs == 0 {
            bail!("timeouts must be at least 1 second");
        }
        Ok(())
    }

    /// Check the root is an existing directory and make it absolute.
    pub fn canonical_root(&self) -> Result<PathBuf> {
        if !self.root.exists() {
            bail!("Root directory does not exist: {}", self.root.display());
        }
        if !self.root.is_dir() {
            bail!("Root path is not a directory: {}", self.root.display());
        }
        std::fs::canonicalize(&self.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", self.root.display()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}
