use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use emberdb::config::ServerConfig;
use emberdb::protocol::{Protocol, ProtocolFactory, StartupProtocol};
use emberdb::server::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env();
    info!(host = %config.host, port = config.port, "emberdb front-end starting");

    let factory: ProtocolFactory = Arc::new(|| Box::new(StartupProtocol::new()) as Box<dyn Protocol>);
    let server = Server::bind(config, factory)?;
    server.serve()?;

    Ok(())
}
