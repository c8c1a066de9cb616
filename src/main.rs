use std::path::PathBuf;

use clap::{Parser, Subcommand};
use collectproxy::{
    config::Config,
    logging,
    store::{ExampleStore as _, FsStore},
};

#[derive(Debug, Parser)]
#[command(name = "collectproxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the record-and-replay proxy.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect the example store.
    Example {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: ExampleCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum ExampleCommand {
    /// List recorded example keys.
    List,
}

fn run_example_command(config: &Config, command: ExampleCommand) -> anyhow::Result<Vec<String>> {
    let store = FsStore::new(&config.store.path);
    match command {
        ExampleCommand::List => {
            let keys = store.list(&config.store.namespace)?;
            Ok(keys)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let proxy = collectproxy::proxy::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
        Command::Example { config, action } => {
            let config = Config::load(config.as_deref())?;
            for key in run_example_command(&config, action)? {
                println!("{key}");
            }
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: std::net::SocketAddr) -> String {
    format!(
        "startup config: listen={}, store_path={}, namespace={}",
        listen_addr,
        config.store.path.display(),
        config.store.namespace
    )
}
