use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    error::EngineError,
    store::{LinkId, Policy, PolicyInput},
    AppState,
};

// ── IP extraction ────────────────────────────────────────────────────────────

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
/// Forwarded headers are trusted as-is.
pub fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub password: String,
    #[serde(flatten)]
    pub policy: PolicyInput,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: String,
    pub url: String,
}

pub async fn create_password(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    if body.password.is_empty() {
        return bad_request("password must not be empty");
    }
    if body.password.len() > state.max_secret_bytes {
        return bad_request(&format!(
            "password exceeds {} byte limit",
            state.max_secret_bytes
        ));
    }
    let policy = match Policy::from_input(&body.policy) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };

    let engine = state.engine.clone();
    let password = body.password;
    let created = tokio::task::spawn_blocking(move || engine.create(&password, policy)).await;

    match created {
        Ok(Ok(id)) => {
            let id = id.to_string();
            let url = format!("{}/password/{}", state.base_url, id);
            (StatusCode::CREATED, Json(CreateResponse { id, url })).into_response()
        }
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(e),
    }
}

// ── View ──────────────────────────────────────────────────────────────────────

/// Acknowledge a link without touching it, so previews and crawlers never burn a view.
pub async fn view_password(Path(id): Path<String>) -> Response {
    match id.parse::<LinkId>() {
        Ok(id) => Json(json!({ "id": id.to_string() })).into_response(),
        Err(_) => not_found(),
    }
}

// ── Reveal ────────────────────────────────────────────────────────────────────

pub async fn reveal_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = id.parse::<LinkId>() else {
        debug!(raw = %id, "malformed link id");
        return not_found();
    };
    let ip = extract_ip(&headers, &addr);

    let engine = state.engine.clone();
    let consumed = tokio::task::spawn_blocking(move || engine.consume(&id, &ip)).await;

    match consumed {
        Ok(Ok(password)) => {
            info!(link_id = %id, "password revealed");
            (
                [(header::CACHE_CONTROL, "no-store")],
                Json(json!({ "password": password })),
            )
                .into_response()
        }
        Ok(Err(e)) => engine_error(e),
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::NotFound => not_found(),
        EngineError::ConflictRetryExhausted { attempts } => {
            warn!(attempts, "view counter contention");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "busy, try again"})),
            )
                .into_response()
        }
        EngineError::Store(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.10:55555".parse().unwrap()
    }

    #[test]
    fn forwarded_for_wins() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static(" 1.2.3.4 , 10.0.0.1"));
        h.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_ip(&h, &peer()), "1.2.3.4");
    }

    #[test]
    fn real_ip_then_peer() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("  "));
        h.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_ip(&h, &peer()), "9.9.9.9");
        assert_eq!(extract_ip(&HeaderMap::new(), &peer()), "192.0.2.10");
    }
}
