//! Standalone mock EDC server.
//!
//! Serves the in-memory backend on `MOCK_EDC_ADDR` (default `127.0.0.1:3001`) so the harness
//! binaries can be pointed at it with `EDC_API_URL=http://127.0.0.1:3001/api`. State lives in
//! memory and is lost when the process exits.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mock_edc=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("MOCK_EDC_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".into());
    tracing::info!("-- Starting mock EDC on {}", addr);

    let app = mock_edc::router(Arc::new(mock_edc::Store::default()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
