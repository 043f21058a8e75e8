//! Sandbox server backed by local processes.
//!
//! Run with: cargo run -p remote-sandbox-server
//!
//! Environment:
//! - `REMOTE_SANDBOX_ADDR` - listen address (default `127.0.0.1:3000`)
//! - `REMOTE_SANDBOX_DIR` - directory holding sandbox workspaces
//! - `REMOTE_SANDBOX_*` - limits, see `SandboxConfig::from_env`

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use remote_sandbox_core::{SandboxConfig, SandboxProvider};
use remote_sandbox_local::LocalProvider;
use remote_sandbox_session::{RegistryConfig, SessionRegistry};
use remote_sandbox_transport::{SandboxState, router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = SandboxConfig::from_env().context("invalid sandbox configuration")?;
    let addr: SocketAddr = std::env::var("REMOTE_SANDBOX_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("invalid REMOTE_SANDBOX_ADDR")?;
    let base_dir = std::env::var_os("REMOTE_SANDBOX_DIR").map_or_else(LocalProvider::default_base_dir, PathBuf::from);

    tokio::fs::create_dir_all(&base_dir)
        .await
        .with_context(|| format!("cannot create sandbox directory {}", base_dir.display()))?;
    tracing::info!(base_dir = %base_dir.display(), ?config, "Using local sandboxes");

    let provider: Arc<dyn SandboxProvider> = Arc::new(LocalProvider::new(base_dir, config.command_timeout));
    let registry = SessionRegistry::new(provider, RegistryConfig::from(&config));

    let app = router(SandboxState::new(registry, &config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
