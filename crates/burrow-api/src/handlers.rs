//! Management endpoint handlers

use axum::extract::{Path, RawQuery, State};
use axum::http::header::HOST;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Serialize;

use burrow_core::ClientId;

use crate::error::ApiError;
use crate::state::ApiState;

/// Connection info returned for a freshly created tunnel.
#[derive(Debug, Serialize)]
pub struct NewTunnelResponse {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    pub url: String,
}

/// `GET /api/status` body.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tunnels: usize,
    pub mem: MemInfo,
}

/// Process memory snapshot.
#[derive(Debug, Serialize)]
pub struct MemInfo {
    /// Resident set size in bytes; null where the platform hides it
    pub rss: Option<u64>,
}

/// `GET /`: `?new` creates a tunnel under a generated id, anything else
/// goes to the landing page.
pub async fn root(
    State(state): State<ApiState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let wants_new = query
        .as_deref()
        .map(|q| q.split('&').any(|p| p == "new" || p.starts_with("new=")))
        .unwrap_or(false);
    if wants_new {
        let response = create_tunnel(&state, None, &headers).await?;
        Ok(response.into_response())
    } else {
        Ok(Redirect::temporary(&state.config.landing_url).into_response())
    }
}

/// `GET /{id}`: request a specific subdomain. The registry may substitute
/// a fresh id when the requested one is taken; callers learn the actual id
/// from the response.
pub async fn named(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NewTunnelResponse>, ApiError> {
    let id = ClientId::new(id).map_err(|_| ApiError::InvalidSubdomain)?;
    create_tunnel(&state, Some(id), &headers).await
}

/// `GET /api/status`
pub async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.registry.stats().tunnels,
        mem: MemInfo { rss: process_rss() },
    })
}

async fn create_tunnel(
    state: &ApiState,
    requested: Option<ClientId>,
    headers: &HeaderMap,
) -> Result<Json<NewTunnelResponse>, ApiError> {
    let info = state.registry.create(requested).await?;

    // The public url is built from the Host the caller used, so it works
    // for any name pointing at this server; port suffixes ride along.
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
        .or_else(|| state.config.domain.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let url = format!("{}://{}.{}", state.config.scheme(), info.id, host);

    Ok(Json(NewTunnelResponse {
        id: info.id.to_string(),
        port: info.port,
        max_conn_count: info.max_conn_count,
        url,
    }))
}

/// Resident set size from procfs; this server runs behind a supervisor on
/// Linux, elsewhere the field stays null.
fn process_rss() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
