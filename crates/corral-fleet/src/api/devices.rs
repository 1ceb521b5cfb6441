//! Organisation, profile, device, and config management endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::convergence::{ConfigView, MassWriteOutcome};
use crate::registry::{
    CreateDeviceRequest, CreateProfileRequest, DeviceDetail, DeviceSummary, UpdateDeviceRequest,
};
use crate::types::{ConfigKind, Device, Profile, Slots};

use super::{fail, require_org, ApiError, AppState};

/// Request to create an organisation.
#[derive(Debug, Deserialize)]
pub struct CreateOrgRequest {
    /// Organisation display name.
    pub name: String,
}

/// Response for a created organisation, including its capability token.
#[derive(Debug, Serialize)]
pub struct CreateOrgResponse {
    /// Organisation identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Capability token for org-scoped calls. Shown once, on creation.
    pub token: String,
}

/// Create a new organisation.
pub async fn create_org(
    State(state): State<AppState>,
    Json(request): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<CreateOrgResponse>), ApiError> {
    let org = state
        .registry
        .create_organisation(request.name)
        .await
        .map_err(fail)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrgResponse {
            id: org.id.to_string(),
            name: org.name,
            token: org.token,
        }),
    ))
}

/// Create a profile in the caller's organisation.
pub async fn create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateProfileRequest>,
) -> Result<(StatusCode, Json<Profile>), ApiError> {
    let org = require_org(&state, &headers).await?;

    let profile = state
        .registry
        .create_profile(&org.id, request)
        .await
        .map_err(fail)?;

    Ok((StatusCode::CREATED, Json(profile)))
}

/// List the caller's profiles.
pub async fn list_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Profile>>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let profiles = state.registry.list_profiles(&org.id).await.map_err(fail)?;
    Ok(Json(profiles))
}

/// Register a new device.
pub async fn create_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let org = require_org(&state, &headers).await?;

    info!(name = %request.name, org = %org.id, "creating device via API");
    let device = state
        .registry
        .create_device(&org.id, request)
        .await
        .map_err(fail)?;

    Ok((StatusCode::CREATED, Json(device)))
}

/// List the caller's devices.
pub async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let devices = state.registry.list_devices(&org.id).await.map_err(fail)?;
    Ok(Json(devices))
}

/// Get a device's detailed view.
pub async fn get_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
) -> Result<Json<DeviceDetail>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let detail = state
        .registry
        .get_device(&org.id, device_id)
        .await
        .map_err(fail)?;
    Ok(Json(detail))
}

/// Partially update a device.
pub async fn update_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
    Json(request): Json<UpdateDeviceRequest>,
) -> Result<Json<Device>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let device = state
        .registry
        .update_device(&org.id, device_id, request)
        .await
        .map_err(fail)?;
    Ok(Json(device))
}

/// Config write payload.
#[derive(Debug, Deserialize)]
pub struct WriteConfigRequest {
    /// Partial slot values; absent slots carry forward.
    #[serde(default)]
    pub configs: Slots<ConfigKind>,
}

/// Write a config snapshot for a device (management path; the new snapshot
/// awaits device pickup).
pub async fn write_config(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Json(request): Json<WriteConfigRequest>,
) -> Result<Json<ConfigView>, ApiError> {
    let view = state
        .convergence
        .write_config(device_id, request.configs)
        .await
        .map_err(fail)?;
    Ok(Json(view))
}

/// Read a device's current config without acknowledging it.
pub async fn read_config(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
) -> Result<Json<ConfigView>, ApiError> {
    let view = state
        .convergence
        .read_latest_config(device_id)
        .await
        .map_err(fail)?;
    Ok(Json(view))
}

/// Mass config write payload.
#[derive(Debug, Deserialize)]
pub struct MassWriteRequest {
    /// Devices to write to.
    #[serde(rename = "deviceIDs")]
    pub device_ids: Vec<i64>,
    /// Slot values; empty strings and absent slots carry forward.
    #[serde(default)]
    pub configs: Slots<ConfigKind>,
}

/// Apply one config write to many devices; failures are collected, not fatal.
pub async fn mass_write_config(
    State(state): State<AppState>,
    Json(request): Json<MassWriteRequest>,
) -> Result<Json<MassWriteOutcome>, ApiError> {
    let outcome = state
        .convergence
        .mass_write_config(&request.device_ids, &request.configs)
        .await
        .map_err(fail)?;
    Ok(Json(outcome))
}
