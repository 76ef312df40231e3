use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use storage::Store;

/// Append-only, segmented key/value storage daemon.
#[derive(Debug, Parser)]
#[command(name = "storaged")]
#[command(about = "Segmented key/value storage daemon", long_about = None)]
struct Cli {
    /// Port to listen on.
    #[clap(long, env = "STORAGED_PORT", default_value = "8083")]
    port: u16,
    /// Directory holding segment files.
    #[clap(long, env = "STORAGED_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Maximum size in bytes of a single segment before rotation.
    #[clap(long, env = "STORAGED_SEGMENT_SIZE", default_value = "250")]
    segment_size: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Cli::parse();

    let store = Arc::new(Store::open(&args.data_dir, args.segment_size)?);
    let app = storage::http::router(store).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, data_dir = %args.data_dir.display(), "storaged listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
