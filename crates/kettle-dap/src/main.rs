use std::path::PathBuf;

use clap::Parser;
use kettle_config::{KettleConfig, CONFIG_ENV_VAR};

/// Debug adapter that drives `jdb` on behalf of a DAP frontend.
///
/// The adapter speaks DAP over stdio; logs go to stderr and/or the configured log file.
#[derive(Debug, Parser)]
#[command(name = "kettle-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `KETTLE_CONFIG` is used as a fallback. When neither is provided the adapter
    /// uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config);
    let log_buffer = kettle_dap::hardening::init(&config.logging);

    let result = kettle_dap::server::run_stdio(&config).await;
    if let Err(err) = &result {
        tracing::error!(target: "kettle.dap", error = %err, "adapter stopped");
        if !config.logging.stderr {
            for line in log_buffer.last_lines(20) {
                eprintln!("{line}");
            }
        }
    }
    result
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
                "kettle-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            KettleConfig::default()
        }
    }
}
