//! Device self-service and data submission endpoints.
//!
//! The `/self/...` routes are the device-facing side of the pull/ack
//! protocol, authenticated with the organisation's capability token. The
//! telemetry and metadata submission routes authenticate with the device
//! write credential instead.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::convergence::{ConfigView, PollOutcome};
use crate::ledger::{BulkTelemetryRow, MetadataReceipt, MetadataView};
use crate::types::{ConfigKind, FieldKind, MetadataKind, Slots};

use super::{fail, require_org, require_writekey, ApiError, AppState};

/// The device pull path: fetch the latest config and acknowledge it.
pub async fn poll_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
) -> Result<Json<PollOutcome>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let outcome = state
        .convergence
        .poll_and_ack(&org.id, device_id)
        .await
        .map_err(fail)?;
    Ok(Json(outcome))
}

/// Org-scoped config push payload.
#[derive(Debug, Deserialize)]
pub struct PushConfigRequest {
    /// Partial slot values; absent slots carry forward.
    #[serde(default)]
    pub configs: Slots<ConfigKind>,
}

/// Write a config snapshot on behalf of the organisation.
///
/// The snapshot is created pre-acknowledged: the caller already knows it, so
/// the device is not prompted to fetch it again.
pub async fn push_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
    Json(request): Json<PushConfigRequest>,
) -> Result<Json<ConfigView>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let view = state
        .convergence
        .write_config_preacknowledged(&org.id, device_id, request.configs)
        .await
        .map_err(fail)?;
    Ok(Json(view))
}

/// Latest metadata with status, org-scoped.
pub async fn latest_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
) -> Result<Json<MetadataView>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let view = state
        .ledger
        .latest_metadata(&org.id, device_id)
        .await
        .map_err(fail)?;
    Ok(Json(view))
}

/// Org-scoped metadata write payload.
#[derive(Debug, Deserialize)]
pub struct WriteMetadataRequest {
    /// Metadata slot values.
    #[serde(default)]
    pub metadata: Slots<MetadataKind>,
}

/// Write a metadata snapshot on behalf of the organisation.
pub async fn write_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
    Json(request): Json<WriteMetadataRequest>,
) -> Result<Json<MetadataReceipt>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let receipt = state
        .ledger
        .record_metadata_for_org(&org.id, device_id, request.metadata)
        .await
        .map_err(fail)?;
    Ok(Json(receipt))
}

/// Telemetry submission payload (authenticated by `X-Write-Key`).
#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    /// Field values.
    #[serde(flatten)]
    pub fields: Slots<FieldKind>,
}

/// Telemetry submission receipt.
#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Assigned per-device sequence number.
    #[serde(rename = "entryID")]
    pub entry_id: i64,
}

/// Record one telemetry entry submitted by a device.
pub async fn record_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TelemetryRequest>,
) -> Result<Json<TelemetryResponse>, ApiError> {
    let writekey = require_writekey(&headers)?;
    let entry = state
        .ledger
        .record_telemetry(&writekey, request.fields)
        .await
        .map_err(fail)?;

    Ok(Json(TelemetryResponse {
        device_id: entry.device_id,
        entry_id: entry.entry_id,
    }))
}

/// Bulk telemetry import payload.
#[derive(Debug, Deserialize)]
pub struct BulkTelemetryRequest {
    /// Rows to import, in sequence order.
    pub updates: Vec<BulkTelemetryRow>,
}

/// Bulk telemetry import receipt.
#[derive(Debug, Serialize)]
pub struct BulkTelemetryResponse {
    /// How many rows were written.
    pub written: usize,
}

/// Import a batch of telemetry rows for a device.
pub async fn bulk_telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Json(request): Json<BulkTelemetryRequest>,
) -> Result<Json<BulkTelemetryResponse>, ApiError> {
    let written = state
        .ledger
        .bulk_record_telemetry(device_id, request.updates)
        .await
        .map_err(fail)?;
    Ok(Json(BulkTelemetryResponse { written }))
}

/// Metadata submission payload (authenticated by `X-Write-Key`).
#[derive(Debug, Deserialize)]
pub struct MetadataRequest {
    /// Metadata slot values.
    #[serde(flatten)]
    pub metadata: Slots<MetadataKind>,
}

/// Metadata submission receipt.
#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
}

/// Record a metadata snapshot submitted by a device.
pub async fn record_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MetadataRequest>,
) -> Result<Json<MetadataResponse>, ApiError> {
    let writekey = require_writekey(&headers)?;
    let snapshot = state
        .ledger
        .record_metadata(&writekey, request.metadata)
        .await
        .map_err(fail)?;

    Ok(Json(MetadataResponse {
        device_id: snapshot.device_id,
    }))
}
