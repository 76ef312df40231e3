//! Application server: exposes a small read-through API over the storage
//! daemon and seeds a `winners` key with today's date on startup.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;

const HEALTH_FAILURE_ENV: &str = "CONF_HEALTH_FAILURE";
const SEED_KEY: &str = "winners";
const SEED_MAX_RETRIES: u32 = 10;
const SEED_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Application server fronting the storage daemon.
#[derive(Debug, Parser)]
#[command(name = "appserver")]
#[command(about = "Application server", long_about = None)]
struct Cli {
    #[clap(long, env = "APPSERVER_PORT", default_value = "8080")]
    port: u16,
    #[clap(long, env = "APPSERVER_STORAGE_URL", default_value = "http://localhost:8083")]
    storage_url: String,
}

#[derive(Clone)]
struct AppState {
    http: reqwest::Client,
    storage_url: String,
}

#[derive(Debug, Deserialize)]
struct SomeDataQuery {
    key: Option<String>,
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

    let http = reqwest::Client::builder().timeout(Duration::from_secs(3)).build()?;
    let state = AppState {
        http: http.clone(),
        storage_url: args.storage_url.clone(),
    };

    tokio::spawn(seed_current_date(http, args.storage_url.clone()));

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/some-data", get(handle_some_data))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, storage_url = %args.storage_url, "appserver listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_health() -> Response {
    let fail = std::env::var(HEALTH_FAILURE_ENV).as_deref() == Ok("true");
    let status = if fail { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
    let body = if fail { "FAILURE" } else { "OK" };
    (status, [("content-type", "text/plain")], body).into_response()
}

async fn handle_some_data(
    State(state): State<AppState>,
    Query(query): Query<SomeDataQuery>,
) -> Response {
    let Some(key) = query.key.filter(|k| !k.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Key required").into_response();
    };

    let url = format!("{}/db/{key}", state.storage_url);
    let response = match state.http.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%key, error = %err, "storage unreachable");
            return (StatusCode::SERVICE_UNAVAILABLE, "Service is not available").into_response();
        }
    };

    if response.status() == StatusCode::NOT_FOUND {
        return StatusCode::NOT_FOUND.into_response();
    }

    match response.json::<Value>().await {
        Ok(data) => (StatusCode::OK, Json(data)).into_response(),
        Err(err) => {
            tracing::error!(%key, error = %err, "error while decoding storage response");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error while decoding response").into_response()
        }
    }
}

/// Seed the `winners` key with today's date, retrying up to
/// [`SEED_MAX_RETRIES`] times, [`SEED_RETRY_DELAY`] apart. Runs in the
/// background so the server can accept requests immediately; failure after
/// all retries is logged and otherwise ignored.
async fn seed_current_date(http: reqwest::Client, storage_url: String) {
    for attempt in 1..=SEED_MAX_RETRIES {
        match try_seed_current_date(&http, &storage_url).await {
            Ok(()) => {
                tracing::info!("successfully saved current date to database");
                return;
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "attempt failed to save current date");
                if attempt < SEED_MAX_RETRIES {
                    tracing::info!(delay = ?SEED_RETRY_DELAY, "retrying date seed");
                    tokio::time::sleep(SEED_RETRY_DELAY).await;
                }
            }
        }
    }
    tracing::warn!(
        attempts = SEED_MAX_RETRIES,
        "failed to save current date after all attempts, continuing without it"
    );
}

async fn try_seed_current_date(http: &reqwest::Client, storage_url: &str) -> Result<()> {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let url = format!("{storage_url}/db/{SEED_KEY}");
    http.post(&url)
        .json(&serde_json::json!({ "value": today }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get as axum_get, post as axum_post};
    use axum::Json as AxumJson;
    use std::sync::Mutex;

    /// Serializes tests that touch `CONF_HEALTH_FAILURE`, since env vars are
    /// process-global and tests otherwise run concurrently.
    static HEALTH_ENV_LOCK: Mutex<()> = Mutex::new(());

    #[tokio::test]
    async fn health_reports_ok_by_default() {
        let _guard = HEALTH_ENV_LOCK.lock().unwrap();
        std::env::remove_var(HEALTH_FAILURE_ENV);
        let response = handle_health().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_failure_when_env_set() {
        let _guard = HEALTH_ENV_LOCK.lock().unwrap();
        std::env::set_var(HEALTH_FAILURE_ENV, "true");
        let response = handle_health().await;
        std::env::remove_var(HEALTH_FAILURE_ENV);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    async fn stub_state(router: Router) -> AppState {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        AppState {
            http: reqwest::Client::new(),
            storage_url: format!("http://{addr}"),
        }
    }

    #[tokio::test]
    async fn some_data_requires_a_key() {
        let state = stub_state(Router::new()).await;
        let response = handle_some_data(State(state), Query(SomeDataQuery { key: None })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn some_data_passes_through_storage_hit() {
        let router = Router::new().route(
            "/db/:key",
            axum_get(|| async { AxumJson(serde_json::json!({"key": "winners", "value": "2026-07-28"})) }),
        );
        let state = stub_state(router).await;
        let response = handle_some_data(
            State(state),
            Query(SomeDataQuery { key: Some("winners".to_string()) }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn some_data_passes_through_storage_miss() {
        let router = Router::new().route("/db/:key", axum_get(|| async { StatusCode::NOT_FOUND }));
        let state = stub_state(router).await;
        let response = handle_some_data(
            State(state),
            Query(SomeDataQuery { key: Some("absent".to_string()) }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn some_data_reports_503_when_storage_unreachable() {
        let state = AppState {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
            storage_url: "http://127.0.0.1:1".to_string(),
        };
        let response = handle_some_data(
            State(state),
            Query(SomeDataQuery { key: Some("k".to_string()) }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn seed_current_date_succeeds_against_a_live_store() {
        let router = Router::new().route("/db/:key", axum_post(|| async { StatusCode::CREATED }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = reqwest::Client::new();
        let result = try_seed_current_date(&http, &format!("http://{addr}")).await;
        assert!(result.is_ok());
    }
}
