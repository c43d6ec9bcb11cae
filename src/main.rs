use anyhow::Context;
use iot_pnp_functions::clients::Clients;
use iot_pnp_functions::config::Config;
use iot_pnp_functions::server::{build_router, AppState};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    iot_pnp_functions::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load_from_env().map_err(anyhow::Error::msg)?;
    let http = iot_pnp_functions::http_client(&config).map_err(|e| anyhow::anyhow!(e))?;
    let clients = Clients::new(&config, http);

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
    let state = AppState {
        clients,
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);
    axum::serve(listener, build_router(state))
        .await
        .context("custom handler server stopped")?;
    Ok(())
}
