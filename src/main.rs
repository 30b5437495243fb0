use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use postern_common::config::ServerConfig;
use postern_server::Server;

#[derive(Parser, Debug)]
#[command(name = "postern", about = "Mail server: SMTP ingress, durable queueing, relay")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "postern.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.check {
        println!("configuration OK: domain={}", config.domain);
        return Ok(());
    }

    Server::new(config).run().await
}
