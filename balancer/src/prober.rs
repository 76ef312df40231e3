use std::sync::Arc;
use std::time::Duration;

use crate::selector::health;
use crate::state::BalancerState;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically probes every backend purely for operator visibility.
/// Selection always performs its own live probe; this loop never feeds into
/// or blocks selection.
pub async fn run(state: Arc<BalancerState>) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    loop {
        ticker.tick().await;
        for backend in &state.backends {
            let healthy = health(&state, backend).await;
            tracing::info!(%backend, healthy, "periodic health check");
        }
    }
}
