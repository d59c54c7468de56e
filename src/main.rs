//! Volley rate-limited request dispatcher.
//!
//! Loads configuration, dispatches every configured target across the
//! configured pools and prints a JSON summary of the run.

use anyhow::{Context, Result};
use tracing::info;
use volley::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = Config::load()?;
    info!(
        rate = config.rate,
        pools = config.pools.len(),
        targets = config.targets.len(),
        use_store = config.use_store,
        use_rps = config.use_rps,
        "Configuration loaded"
    );

    let summary = volley::run(&config).await?;
    info!(outcome = ?summary.report.outcome, "Run complete");

    let rendered =
        serde_json::to_string_pretty(&summary.to_json()).context("Failed to render summary")?;
    println!("{rendered}");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,volley=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_writer(std::io::stderr);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}
