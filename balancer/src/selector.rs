use crate::state::BalancerState;

/// Probe `backend`'s `/health` endpoint; any outcome other than a bare `200`
/// (timeout, connection failure, non-200) counts as unhealthy.
pub async fn health(state: &BalancerState, backend: &str) -> bool {
    let url = state.backend_url(backend, "/health");
    match state.http.get(&url).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}

/// Pick the index of the healthy backend with the smallest traffic counter,
/// pool order as tie-break. Falls back to the first pool entry if none are
/// healthy (the caller observes the resulting downstream failure naturally).
pub async fn select_backend(state: &BalancerState) -> usize {
    let mut best: Option<(usize, u64)> = None;

    for (index, backend) in state.backends.iter().enumerate() {
        if !health(state, backend).await {
            continue;
        }
        let count = state.counter(index);
        match best {
            Some((_, min)) if count >= min => {}
            _ => best = Some((index, count)),
        }
    }

    best.map(|(index, _)| index).unwrap_or(0)
}
