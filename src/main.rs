use tracing::info;

use driftwood::irc::server::{self, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::default();
    info!("driftwood on {}", config.server_name);

    // Bind addresses: comma-separated override via DRIFTWOOD_ADDRS.
    let addrs: Vec<String> = match std::env::var("DRIFTWOOD_ADDRS") {
        Ok(list) => list
            .split(',')
            .map(|a| a.trim().to_owned())
            .filter(|a| !a.is_empty())
            .collect(),
        Err(_) => vec!["0.0.0.0:6667".to_owned()],
    };

    server::run(config, &addrs).await?;
    Ok(())
}
