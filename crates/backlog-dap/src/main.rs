use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use backlog_config::{AdapterConfig, CONFIG_ENV_VAR};

/// Debug adapter for a routing engine's backlog debugger.
///
/// Speaks the Debug Adapter Protocol over stdio and attaches to the engine's
/// debugger endpoint (`host:port`) named by the `attach` request.
#[derive(Debug, Parser)]
#[command(name = "backlog-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `BACKLOG_DAP_CONFIG` is used as a fallback. When neither is
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config);
    backlog_dap::hardening::init(&config, Arc::new(|message| eprintln!("{message}")));
    tracing::info!(target: "backlog.dap", version = env!("CARGO_PKG_VERSION"), "backlog-dap starting");

    backlog_dap::server::run_stdio(&config).await
}

fn load_config(cli_path: Option<PathBuf>) -> AdapterConfig {
    match AdapterConfig::discover(cli_path.as_deref()) {
        Ok((config, _)) => config,
        Err(err) => {
            // Logging is not up yet.
            eprintln!("backlog-dap: failed to load config ({CONFIG_ENV_VAR} or --config): {err}; continuing with defaults");
            AdapterConfig::default()
        }
    }
}
