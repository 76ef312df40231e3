//! HTTP adapter exposing the storage engine as `GET`/`POST /db/<key>`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::{self, Store};

#[derive(Debug, Serialize)]
struct GetResponse<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct PutRequest {
    value: String,
}

pub fn router(store: Arc<Store>) -> Router {
    Router::new().route("/db/:key", any(handle_db)).with_state(store)
}

async fn handle_db(
    method: Method,
    Path(key): Path<String>,
    State(store): State<Arc<Store>>,
    body: axum::body::Bytes,
) -> Response {
    match method {
        Method::GET => {
            tokio::task::spawn_blocking(move || handle_get(&store, &key))
                .await
                .expect("storage read task panicked")
        }
        Method::POST => {
            tokio::task::spawn_blocking(move || handle_post(&store, &key, &body))
                .await
                .expect("storage write task panicked")
        }
        _ => error_response(StatusCode::BAD_REQUEST, "Method not allowed"),
    }
}

fn handle_get(store: &Store, key: &str) -> Response {
    match store.get(key.as_bytes()) {
        Ok(value) => {
            let value = String::from_utf8_lossy(&value).into_owned();
            let body = GetResponse {
                key,
                value: &value,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(store::Error::NotFound) => error_response(StatusCode::NOT_FOUND, "Not found"),
        Err(err) => {
            tracing::warn!(%key, error = %err, "storage read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage read failed")
        }
    }
}

fn handle_post(store: &Store, key: &str, body: &[u8]) -> Response {
    let req: PutRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Malformed JSON body"),
    };

    match store.put(key.as_bytes(), req.value.as_bytes()) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => {
            tracing::warn!(%key, error = %err, "storage write failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage write failed")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
