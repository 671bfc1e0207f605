//! REST API endpoints for the headset-service.
//!
//! Every handler forwards to the gateway reactor through the
//! [`ReactorHandle`](crate::reactor::ReactorHandle) in [`AppState`] and
//! answers with the session as it stands afterwards. Connect and play
//! requests only return once the session has reached Connected or Playing,
//! or the attempt failed.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`], with a
//! human-readable `error` and a machine-readable `kind`:
//!
//! | Gateway error | Status |
//! |---------------|--------|
//! | unknown device | 404 |
//! | invalid or malformed argument | 400 |
//! | not connected, already connected, in progress, no active headset, busy | 409 |
//! | not available, telephony not ready | 503 |
//! | transport failure | 502 |
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use headset_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use headset_core::{Error, SessionInfo};
use headset_types::{DeviceAddress, GainKind};

use crate::reactor::ReactorError;
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        // Sessions
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{address}", get(get_device))
        .route("/api/devices/{address}/connect", post(connect))
        .route("/api/devices/{address}/disconnect", post(disconnect))
        .route("/api/devices/{address}/play", post(play))
        .route("/api/devices/{address}/stop", post(stop))
        .route("/api/devices/{address}/ring", post(ring))
        .route("/api/devices/{address}/cancel-call", post(cancel_call))
        .route(
            "/api/devices/{address}/gain/{kind}",
            get(get_gain).put(set_gain),
        )
        // Telephony simulation
        .route("/api/telephony/incoming", post(incoming_call))
        .route("/api/telephony/hangup", post(hang_up))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Whether the gateway reactor still accepts requests.
    pub gateway: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let gateway = state.gateway.is_running();
    Json(HealthResponse {
        status: if gateway { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        gateway,
        started_at: state.started_at,
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// A session with its configured alias.
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub alias: Option<String>,
}

impl DeviceResponse {
    fn new(state: &AppState, session: SessionInfo) -> Self {
        let alias = state.alias(&session.address.to_string()).map(str::to_owned);
        Self { session, alias }
    }
}

fn parse_address(address: &str) -> Result<DeviceAddress, AppError> {
    address
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid Bluetooth address: {address}")))
}

async fn device_response(
    state: &AppState,
    device: DeviceAddress,
) -> Result<Json<DeviceResponse>, AppError> {
    let session = state.gateway.device(device).await?;
    Ok(Json(DeviceResponse::new(state, session)))
}

/// List every configured headset.
async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceResponse>>, AppError> {
    let mut sessions = state.gateway.devices().await?;
    sessions.sort_by_key(|s| s.address.octets());
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| DeviceResponse::new(&state, s))
            .collect(),
    ))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    device_response(&state, parse_address(&address)?).await
}

/// Connect the control channel; returns once the session is Connected.
async fn connect(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.connect(device).await?;
    device_response(&state, device).await
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.disconnect(device).await?;
    device_response(&state, device).await
}

/// Open audio; returns once the session is Playing.
async fn play(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.play(device).await?;
    device_response(&state, device).await
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.stop(device).await?;
    device_response(&state, device).await
}

/// Start ringing the headset.
async fn ring(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.indicate_call(device).await?;
    device_response(&state, device).await
}

async fn cancel_call(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<DeviceResponse>, AppError> {
    let device = parse_address(&address)?;
    state.gateway.cancel_call(device).await?;
    device_response(&state, device).await
}

/// A speaker or microphone gain.
#[derive(Debug, Serialize)]
pub struct GainResponse {
    pub kind: GainKind,
    pub gain: u8,
}

/// Request body for setting a gain.
#[derive(Debug, Deserialize)]
pub struct SetGainRequest {
    pub gain: u32,
}

fn parse_kind(kind: &str) -> Result<GainKind, AppError> {
    kind.parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown gain kind: {kind}")))
}

async fn get_gain(
    State(state): State<Arc<AppState>>,
    Path((address, kind)): Path<(String, String)>,
) -> Result<Json<GainResponse>, AppError> {
    let device = parse_address(&address)?;
    let kind = parse_kind(&kind)?;
    let gain = state.gateway.gain(device, kind).await?;
    Ok(Json(GainResponse { kind, gain }))
}

/// Set a gain. The headset hears about it right away only while audio is open.
async fn set_gain(
    State(state): State<Arc<AppState>>,
    Path((address, kind)): Path<(String, String)>,
    Json(request): Json<SetGainRequest>,
) -> Result<Json<GainResponse>, AppError> {
    let device = parse_address(&address)?;
    let kind = parse_kind(&kind)?;
    state.gateway.set_gain(device, kind, request.gain).await?;
    let gain = state.gateway.gain(device, kind).await?;
    Ok(Json(GainResponse { kind, gain }))
}

/// Request body for a simulated incoming call.
#[derive(Debug, Default, Deserialize)]
pub struct IncomingCallRequest {
    /// Caller number presented with `+CLIP`.
    #[serde(default)]
    pub number: Option<String>,
}

async fn incoming_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IncomingCallRequest>,
) -> Result<StatusCode, AppError> {
    if let Some(number) = &request.number
        && number.is_empty()
    {
        return Err(AppError::BadRequest(
            "number cannot be empty string (use null/omit instead)".to_string(),
        ));
    }
    state.gateway.incoming_call(request.number).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn hang_up(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.gateway.hang_up().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Gateway(#[from] Error),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Timeout(String),
}

impl From<ReactorError> for AppError {
    fn from(e: ReactorError) -> Self {
        match e {
            ReactorError::Gateway(e) => AppError::Gateway(e),
            ReactorError::Stopped => AppError::Unavailable(e.to_string()),
            ReactorError::Timeout(_) => AppError::Timeout(e.to_string()),
        }
    }
}

/// HTTP status and error kind of a gateway error.
fn classify(e: &Error) -> (StatusCode, &'static str) {
    match e {
        Error::DeviceNotFound(_) => (StatusCode::NOT_FOUND, "device_not_found"),
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        Error::MalformedArgument { .. } | Error::Parse(_) => {
            (StatusCode::BAD_REQUEST, "malformed_argument")
        }
        Error::NotConnected => (StatusCode::CONFLICT, "not_connected"),
        Error::AlreadyConnected => (StatusCode::CONFLICT, "already_connected"),
        Error::AlreadyInProgress => (StatusCode::CONFLICT, "in_progress"),
        Error::NoActiveDevice => (StatusCode::CONFLICT, "no_active_device"),
        Error::Busy => (StatusCode::CONFLICT, "busy"),
        Error::NotAvailable => (StatusCode::SERVICE_UNAVAILABLE, "not_available"),
        Error::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
        Error::NotSupported(_) => (StatusCode::BAD_GATEWAY, "not_supported"),
        Error::TransportFailure { .. } => (StatusCode::BAD_GATEWAY, "transport_failure"),
        Error::Cancelled => (StatusCode::CONFLICT, "cancelled"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Gateway(e) => classify(e),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": kind,
        });

        (status, Json(body)).into_response()
    }
}
