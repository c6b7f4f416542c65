//! stratad — the Strata control daemon.
//!
//! One process per node. It supervises the node's engines, serves the
//! node control API, and on access points also runs the membership and
//! the system API.
//!
//! # Usage
//!
//! ```text
//! stratad start --config /etc/strata/strata.toml
//! stratad --json start --config /etc/strata/strata.toml
//! ```

mod link;
mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use strata_core::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "stratad", about = "Strata control daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon and its engines.
    Start {
        /// Server configuration file.
        #[arg(long, short, default_value = "/etc/strata/strata.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, short, default_value = "/etc/strata/strata.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stratad=debug,strata=debug"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Start { config } => {
            let config = ServerConfig::from_file(&config)?;
            node::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = ServerConfig::from_file(&config)?;
            info!(
                name = %config.name,
                engines = config.engines.len(),
                access_point = config.is_access_point(),
                "configuration is valid"
            );
            Ok(())
        }
    }
}
