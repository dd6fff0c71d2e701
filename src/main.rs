use anyhow::Result;
use clap::Parser;

use ferry::cli::{self, Cli};
use ferry::config::paths;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli::load_settings(cli.config.as_ref())?;

    // File logging when configured, or when FERRY_LOG_DIR points somewhere
    let log_dir = match &settings.logging.directory {
        Some(dir) => {
            let dir = paths::expand_tilde(&dir.to_string_lossy());
            std::fs::create_dir_all(&dir).ok().map(|_| dir)
        }
        None if std::env::var_os("FERRY_LOG_DIR").is_some() => paths::ensure_log_dir().ok(),
        None => None,
    };
    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = ferry::logging::init_logging(&settings.logging, log_dir.clone());

    tracing::info!("Starting ferry {}", env!("CARGO_PKG_VERSION"));
    if let Some(dir) = &log_dir {
        tracing::info!("Logging to {}", dir.display());
    }

    let report = cli::run(cli.command, &settings).await?;
    // stdout may be carrying the downloaded file
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
