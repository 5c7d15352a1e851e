use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use claude_relay::{load_config, serve, watch_config, LogFormat, LoggingConfig, Relay};

#[derive(Debug, Parser)]
#[command(
    name = "claude-relay",
    version,
    about = "Anthropic-compatible reverse proxy for heterogeneous LLM backends"
)]
struct Args {
    /// Path to the configuration file (.yaml, .yml, or .toml).
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    if args.check {
        println!("{}: configuration OK", args.config.display());
        return Ok(());
    }

    init_tracing(&config.logging);

    let relay = Relay::new(config)?;
    let reload_target = Arc::clone(&relay);
    let _watcher = watch_config(
        relay.config_cell(),
        args.config.clone(),
        move |snapshot| reload_target.apply_snapshot(snapshot),
    )?;

    serve(relay).await?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
