use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kettle_config::{KettleConfig, CONFIG_ENV_VAR};
use lsp_server::Connection;

/// Language server that publishes Java lint diagnostics from the analysis server.
///
/// Speaks LSP over stdio; logs go to stderr and/or the configured log file.
#[derive(Debug, Parser)]
#[command(name = "kettle-lint", version, about)]
struct Cli {
    /// Path to a TOML config file. Falls back to `KETTLE_CONFIG`, then to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Accepted for compatibility with editor launch templates; stdio is the only transport.
    #[arg(long, hide = true)]
    stdio: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config);
    kettle_config::init_tracing(&config.logging);

    let (connection, io_threads) = Connection::stdio();
    let clean = kettle_lint::lsp::run(connection, config.lint)
        .await
        .context("language server stopped")?;
    io_threads.join().context("stdio transport failed")?;

    if !clean {
        tracing::warn!(target: "kettle.lint", "exit without shutdown");
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> KettleConfig {
    let path = cli_path.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    let Some(path) = path else {
        return KettleConfig::default();
    };

    match KettleConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "kettle-lint: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            KettleConfig::default()
        }
    }
}
