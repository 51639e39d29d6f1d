use anyhow::{Context, Result};
use compass_backend::config::ServiceConfig;
use compass_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,compass_backend=debug")),
        )
        .init();

    let config = ServiceConfig::load();

    tracing::info!(
        "Starting compass backend on {} (set COMPASS_BACKEND_TOKEN, or COMPASS_BACKEND_AUTH_MODE=disabled behind a trusted gateway)",
        config.bind_addr
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(config))
}
