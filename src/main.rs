//! tabsweep command-line entry point.

mod cli;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Library modules under the paths the CLI expects.
pub(crate) use tabsweep::{config, host, models, services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "tabsweep=info"
    } else {
        "tabsweep=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
