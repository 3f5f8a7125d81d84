use anyhow::{Context, Result};
use clap::Parser;

use ferry::cli::DaemonOpts;
use ferry::config::ServerConfig;
use ferry::logging::init_tracing;
use ferry::server::Server;
use tracing::{info, warn};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(&opts.log_level);

    let cfg = ServerConfig::from_opts(&opts)?;

    info!(
        root = %cfg.root.display(),
        bind = %cfg.bind,
        legacy_list = cfg.legacy_list,
        "starting ferryd"
    );

    // Security warning for 0.0.0.0 binding
    if cfg.bind.starts_with("0.0.0.0") {
        warn!("binding to 0.0.0.0 exposes the share to all interfaces; the protocol has no authentication or encryption");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Server::bind(&cfg).await?;
        server.run_until_ctrl_c().await
    })
}
