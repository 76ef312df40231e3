use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::BalancerState;

/// Rewrite `req` to target `backend` and proxy it, copying response headers,
/// status and body back to the client and metering the body's byte length
/// into `backend`'s traffic counter. Responds `503` without touching the
/// counter if the outbound request itself fails.
pub async fn forward(state: &BalancerState, backend_index: usize, req: Request) -> Response {
    let backend = &state.backends[backend_index];
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = state.backend_url(backend, path_and_query);

    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%backend, error = %err, "failed to buffer inbound request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let outbound = state
        .http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match outbound {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%backend, error = %err, "failed to get response from backend");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        response_headers.append(name, value.clone());
    }

    let body: Bytes = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%backend, error = %err, "failed to read response body from backend");
            Bytes::new()
        }
    };
    state.add_bytes(backend_index, body.len() as u64);
    tracing::info!(%backend, %status, bytes = body.len(), "forwarded request");

    let mut response = (status, body).into_response();
    *response.headers_mut() = response_headers;
    if state.trace {
        if let Ok(value) = backend.parse() {
            response.headers_mut().insert("lb-from", value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BalancerState;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    async fn spawn_echo_backend(body: &'static str) -> String {
        let app = Router::new()
            .route("/", get(move || async move { body }))
            .route("/health", get(|| async { StatusCode::OK }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn meters_response_body_bytes_into_backend_counter() {
        let backend = spawn_echo_backend("hello world").await;
        let state = BalancerState::new(vec![backend], Duration::from_secs(3), false, false);

        let req = Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
        let response = forward(&state, 0, req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.counter(0), 11);
    }

    #[tokio::test]
    async fn adds_lb_from_header_only_when_tracing() {
        let backend = spawn_echo_backend("hi").await;
        let state = BalancerState::new(vec![backend.clone()], Duration::from_secs(3), false, true);

        let req = Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
        let response = forward(&state, 0, req).await;
        assert_eq!(response.headers().get("lb-from").unwrap(), backend.as_str());
    }

    #[tokio::test]
    async fn requests_distribute_across_multiple_healthy_backends() {
        use crate::selector::select_backend;
        use std::collections::HashSet;

        let backends = vec![
            spawn_echo_backend("a").await,
            spawn_echo_backend("b").await,
            spawn_echo_backend("c").await,
        ];
        let state = BalancerState::new(backends, Duration::from_secs(3), false, true);

        let mut served_by = HashSet::new();
        for _ in 0..10 {
            let index = select_backend(&state).await;
            let req = Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
            let response = forward(&state, index, req).await;
            if let Some(header) = response.headers().get("lb-from") {
                served_by.insert(header.to_str().unwrap().to_string());
            }
        }

        assert!(served_by.len() >= 2, "expected requests spread across backends, got {served_by:?}");
    }

    #[tokio::test]
    async fn unreachable_backend_returns_503_without_metering() {
        let state = BalancerState::new(
            vec!["127.0.0.1:1".to_string()],
            Duration::from_millis(200),
            false,
            false,
        );

        let req = Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
        let response = forward(&state, 0, req).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.counter(0), 0);
    }
}
