//! HTTP API for the fleet service.
//!
//! Provides endpoints for:
//! - Device and profile management (create, query, update)
//! - Config writes, mass edits, and the device pull/ack path
//! - Firmware upload, catalog queries, and (resumable) artifact download
//! - Telemetry and metadata submission
//! - Health and readiness checks
//!
//! Authentication is a thin shim here: management calls are assumed to be
//! authenticated upstream, device self-service calls carry the
//! organisation's capability token, and telemetry submission carries the
//! device write credential. The engines trust what this layer resolves.

mod devices;
mod firmware;
mod selfservice;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};

use crate::convergence::ConvergenceEngine;
use crate::error::FleetError;
use crate::ledger::TelemetryLedger;
use crate::registry::DeviceRegistry;
use crate::rollout::RolloutEngine;
use crate::store::FleetStore;
use crate::types::Organisation;

pub use devices::{CreateOrgRequest, MassWriteRequest};
pub use firmware::AssignFirmwareRequest;

/// Shared application state for the fleet service.
#[derive(Clone)]
pub struct AppState {
    /// Fleet store for direct queries.
    pub store: Arc<dyn FleetStore>,
    /// Config convergence engine.
    pub convergence: Arc<ConvergenceEngine>,
    /// Firmware rollout engine.
    pub rollout: Arc<RolloutEngine>,
    /// Device and profile registry.
    pub registry: Arc<DeviceRegistry>,
    /// Telemetry and metadata ledger.
    pub ledger: Arc<TelemetryLedger>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Organisations and profiles
        .route("/orgs", post(devices::create_org))
        .route("/profiles", post(devices::create_profile))
        .route("/profiles", get(devices::list_profiles))
        // Device management
        .route("/devices", post(devices::create_device))
        .route("/devices", get(devices::list_devices))
        .route("/devices/{device_id}", get(devices::get_device))
        .route("/devices/{device_id}", patch(devices::update_device))
        // Config convergence
        .route("/devices/{device_id}/config", post(devices::write_config))
        .route("/devices/{device_id}/config", get(devices::read_config))
        .route("/devices/config", post(devices::mass_write_config))
        // Firmware rollout
        .route("/firmware", post(firmware::upload_firmware))
        .route("/firmware", get(firmware::list_firmware))
        .route("/firmware/{firmware_id}", get(firmware::get_firmware))
        .route("/firmware/{firmware_id}", patch(firmware::update_firmware_type))
        .route(
            "/firmware/{firmware_id}/download/{kind}",
            get(firmware::download_artifact),
        )
        .route(
            "/devices/{device_id}/firmware",
            put(firmware::assign_firmware),
        )
        // Device self-service (org capability token)
        .route(
            "/self/devices/{device_id}/config",
            get(selfservice::poll_config),
        )
        .route(
            "/self/devices/{device_id}/config",
            post(selfservice::push_config),
        )
        .route(
            "/self/devices/{device_id}/metadata",
            get(selfservice::latest_metadata),
        )
        .route(
            "/self/devices/{device_id}/metadata",
            post(selfservice::write_metadata),
        )
        // Device data submission (write credential)
        .route("/telemetry", post(selfservice::record_telemetry))
        .route(
            "/devices/{device_id}/telemetry/bulk",
            post(selfservice::bulk_telemetry),
        )
        .route("/metadata", post(selfservice::record_metadata))
        .with_state(state)
}

/// Error response body.
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    /// Machine-checkable error kind.
    pub kind: &'static str,
    /// Human-readable detail.
    pub error: String,
}

/// The `(status, body)` pair handlers return on failure.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an error to its HTTP status code.
fn error_to_status(error: &FleetError) -> StatusCode {
    match error {
        FleetError::NotFound { .. } => StatusCode::NOT_FOUND,
        FleetError::Conflict(_) => StatusCode::CONFLICT,
        FleetError::Forbidden(_) => StatusCode::FORBIDDEN,
        FleetError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        FleetError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::Serialisation(_) => StatusCode::BAD_REQUEST,
        FleetError::Database(_)
        | FleetError::Storage(_)
        | FleetError::Config(_)
        | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an engine error into the wire error pair.
fn fail(error: FleetError) -> ApiError {
    (
        error_to_status(&error),
        Json(ErrorResponse {
            kind: error.kind(),
            error: error.to_string(),
        }),
    )
}

/// Resolve the caller's organisation from its capability token.
///
/// Accepts `Authorization: Bearer <token>` or `X-Org-Token: <token>`.
async fn require_org(state: &AppState, headers: &HeaderMap) -> Result<Organisation, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-org-token").and_then(|v| v.to_str().ok()))
        .ok_or_else(|| fail(FleetError::forbidden("missing organisation token")))?;

    state
        .store
        .find_org_by_token(token)
        .await
        .map_err(fail)?
        .ok_or_else(|| fail(FleetError::forbidden("invalid organisation token")))
}

/// Resolve the device write credential from headers.
fn require_writekey(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-write-key")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| fail(FleetError::forbidden("missing write key")))
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint: verifies the store answers queries.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.store.next_device_id().await {
        Ok(_) => (StatusCode::OK, Json(ReadyResponse { ready: true })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse { ready: false }),
        ),
    }
}

/// Health response.
#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(serde::Serialize)]
struct ReadyResponse {
    ready: bool,
}
