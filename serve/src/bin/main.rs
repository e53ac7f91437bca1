//! LonelyCat API server.
//!
//! `LONELYCAT_WORKSPACE` selects the workspace root (default `./workspace`);
//! `LONELYCAT_BIND` the listen address (default `127.0.0.1:5173`).

use std::sync::Arc;

use tracing::info;

use serve::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config::load_env();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let workspace = std::env::var("LONELYCAT_WORKSPACE").unwrap_or_else(|_| "workspace".to_string());
    let bind = std::env::var("LONELYCAT_BIND").unwrap_or_else(|_| "127.0.0.1:5173".to_string());

    let state = AppState::new(std::path::Path::new(&workspace))?;
    let router = build_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, %workspace, "lonelycat api listening");
    axum::serve(listener, router).await?;
    Ok(())
}
