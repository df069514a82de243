//! HTTP control routes.
//!
//! | Method | Path | Reply |
//! |--------|------|-------|
//! | GET | `/` | endpoint listing |
//! | GET | `/health` | service name, version, reader status |
//! | GET | `/api/status` | [`StatusReport`] |
//! | POST | `/api/scan/start` | [`ControlReply`] |
//! | POST | `/api/scan/stop` | [`ControlReply`] |
//! | POST | `/api/reader/connect` | [`ControlReply`] |
//! | POST | `/api/scan/read?timeoutMs=N` | first tag of a one-shot scan |
//! | GET | `/ws` | event channel upgrade |
//!
//! Control failures answer `{success: false, error}` with 409 for a scan
//! already in progress and 503 when no reader is usable. A one-shot read
//! that ends without a tag answers 408.

use crate::config::ServerConfig;
use crate::control;
use crate::distributor::DistributorHandle;
use crate::ws;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tagbridge_core::TagReadEvent;
use tagbridge_protocol::{ControlReply, StatusReport};
use tagbridge_session::{ControlError, ServiceHandle};

pub const SERVICE_NAME: &str = "tagbridge";

/// Error of a one-shot read that ended without a tag.
pub const NO_TAG_READ: &str = "no tag read";

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub service: ServiceHandle,
    pub distributor: DistributorHandle,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(service: ServiceHandle, distributor: DistributorHandle, config: ServerConfig) -> Self {
        Self {
            service,
            distributor,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/scan/start", post(start_scan))
        .route("/api/scan/stop", post(stop_scan))
        .route("/api/reader/connect", post(connect_reader))
        .route("/api/scan/read", post(read_once))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}

/// [`ControlError`] as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(error: ControlError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self.0 {
            ControlError::AlreadyScanning => StatusCode::CONFLICT,
            ControlError::UntrustedOrigin => StatusCode::FORBIDDEN,
            ControlError::NoReader | ControlError::Proximity(_) | ControlError::ServiceStopped => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ControlReply::failed(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn index() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /health": "service health and reader status",
            "GET /api/status": "reader and scan status",
            "POST /api/scan/start": "open a scan window",
            "POST /api/scan/stop": "close the scan window",
            "POST /api/reader/connect": "select and connect a reader",
            "POST /api/scan/read": "scan once and return the first tag",
            "GET /ws": "event channel (WebSocket)",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let Ok(status) = state.service.status().await else {
        let body = json!({ "status": "unavailable", "service": SERVICE_NAME });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    };
    let subscribers = state.distributor.subscriber_count().await.unwrap_or(0);

    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "reader": status,
        "subscribers": subscribers,
    }))
    .into_response()
}

async fn status(State(state): State<AppState>) -> ApiResult<StatusReport> {
    Ok(Json(state.service.status().await?))
}

async fn start_scan(State(state): State<AppState>) -> ApiResult<ControlReply> {
    Ok(Json(control::start_scan(&state.service).await?))
}

async fn stop_scan(State(state): State<AppState>) -> ApiResult<ControlReply> {
    Ok(Json(control::stop_scan(&state.service).await?))
}

async fn connect_reader(State(state): State<AppState>) -> ApiResult<ControlReply> {
    Ok(Json(control::connect_reader(&state.service).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ReadParams {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReadReply {
    success: bool,
    #[serde(flatten)]
    read: TagReadEvent,
}

async fn read_once(
    State(state): State<AppState>,
    Query(params): Query<ReadParams>,
) -> Result<Response, ApiError> {
    let limit = params.timeout_ms.map(Duration::from_millis);
    let reply = match control::read_once(&state.service, &state.distributor, limit).await? {
        Some(read) => Json(ReadReply {
            success: true,
            read,
        })
        .into_response(),
        None => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ControlReply::failed(NO_TAG_READ)),
        )
            .into_response(),
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tagbridge_hardware::HardwareError;

    #[rstest]
    #[case(ControlError::AlreadyScanning, StatusCode::CONFLICT)]
    #[case(ControlError::NoReader, StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ControlError::ServiceStopped, StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ControlError::UntrustedOrigin, StatusCode::FORBIDDEN)]
    #[case(
        ControlError::Proximity(HardwareError::disconnected("no subscriber")),
        StatusCode::SERVICE_UNAVAILABLE
    )]
    fn test_error_status_codes(#[case] error: ControlError, #[case] expected: StatusCode) {
        assert_eq!(ApiError::from(error).into_response().status(), expected);
    }
}
