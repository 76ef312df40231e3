//! Least-traffic HTTP load balancer: a transparent reverse proxy in front of
//! a static pool of application-server backends.

mod forwarder;
mod prober;
mod selector;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use clap::Parser;

use state::BalancerState;

/// Least-traffic HTTP load balancer.
#[derive(Debug, Parser)]
#[command(name = "balancer")]
#[command(about = "Least-traffic HTTP load balancer", long_about = None)]
struct Cli {
    /// Port to listen on.
    #[clap(long, env = "BALANCER_PORT", default_value = "8090")]
    port: u16,
    /// Per-request timeout, in seconds, for probes and forwarded requests.
    #[clap(long = "timeout-sec", env = "BALANCER_TIMEOUT_SEC", default_value = "3")]
    timeout_sec: u64,
    /// Speak HTTPS to backends instead of HTTP.
    #[clap(long, env = "BALANCER_HTTPS", default_value_t = false)]
    https: bool,
    /// Add an `lb-from: <backend>` response header identifying the chosen backend.
    #[clap(long, env = "BALANCER_TRACE", default_value_t = false)]
    trace: bool,
    /// Backend pool, as comma-separated `host:port` entries, in selection tie-break order.
    #[clap(
        long = "backends",
        env = "BALANCER_BACKENDS",
        value_delimiter = ',',
        default_value = "127.0.0.1:8081,127.0.0.1:8082,127.0.0.1:8083"
    )]
    backends: Vec<String>,
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

    if args.backends.is_empty() {
        bail!("at least one --backend is required");
    }

    let state = Arc::new(BalancerState::new(
        args.backends.clone(),
        Duration::from_secs(args.timeout_sec),
        args.https,
        args.trace,
    ));

    tokio::spawn(prober::run(Arc::clone(&state)));

    let app = Router::new()
        .fallback(handle_proxy)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, backends = ?args.backends, trace = args.trace, "balancer listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_proxy(State(state): State<Arc<BalancerState>>, req: Request) -> Response {
    let backend_index = selector::select_backend(&state).await;
    forwarder::forward(&state, backend_index, req).await
}
