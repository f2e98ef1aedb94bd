use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fleet=info".parse()?))
        .init();

    let config = fleet_server::config::ServerConfig::load()?;
    fleet_server::server::run(config).await
}
