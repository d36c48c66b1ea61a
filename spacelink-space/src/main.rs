//! spacelink space server — entry point.
//!
//! ```text
//! spacelink-space                    Run in the foreground
//! spacelink-space --config <path>    Load a custom config TOML
//! spacelink-space --gen-config       Write default config to stdout
//! spacelink-space --oh-listen <addr> Override the object-host listen address
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spacelink_space::config::SpaceConfig;
use spacelink_space::service::SpaceServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "spacelink-space", about = "spacelink space server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "spacelink-space.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Address object hosts connect to (overrides the config file).
    #[arg(long)]
    oh_listen: Option<String>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&SpaceConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = SpaceConfig::load(&cli.config);
    if let Some(addr) = cli.oh_listen {
        config.network.oh_listen = addr;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("spacelink-space v{}", env!("CARGO_PKG_VERSION"));
    info!("server id: {}", config.server_id);
    info!("object hosts: {}", config.network.oh_listen);
    info!("peers: {} on {}", config.peers.len(), config.network.peer_listen);

    let server = SpaceServer::new(config);
    let ctx = server.context();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctx.stop();
    });

    server.run().await?;

    Ok(())
}
