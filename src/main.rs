use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relayd=info".parse()?))
        .init();

    let config = relayd::config::ServerConfig::parse();
    tracing::info!("Starting chat server on {}", config.listen_addr);

    let server = relayd::server::Server::new(config);
    server.run().await
}
