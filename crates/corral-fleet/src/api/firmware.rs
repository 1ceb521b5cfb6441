//! Firmware catalog and rollout endpoints.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use crate::error::FleetError;
use crate::rollout::{FirmwarePayload, FirmwareUpload, RangeSpec};
use crate::types::{ArtifactKind, Device, Firmware, FirmwareId, FirmwareType};

use super::{fail, require_org, ApiError, AppState};

/// Upload a firmware image (multipart form).
///
/// Fields: `version` (required), `firmware_type`, `description`, `firmware`
/// (required file; a `.hex` filename marks an Intel HEX payload), and
/// `bootloader` (optional file, stored verbatim).
pub async fn upload_firmware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Firmware>), ApiError> {
    let org = require_org(&state, &headers).await?;

    let mut version: Option<String> = None;
    let mut firmware_type = FirmwareType::default();
    let mut description: Option<String> = None;
    let mut payload: Option<FirmwarePayload> = None;
    let mut bootloader: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| fail(FleetError::Serialisation(format!("bad multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "version" => version = Some(read_text(field).await?),
            "firmware_type" => {
                firmware_type = read_text(field)
                    .await?
                    .parse()
                    .map_err(|e: String| fail(FleetError::Serialisation(e)))?;
            }
            "description" => description = Some(read_text(field).await?),
            "firmware" => {
                let is_hex = field
                    .file_name()
                    .is_some_and(|name| name.ends_with(".hex"));
                let bytes = read_bytes(field).await?;
                payload = Some(if is_hex {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    FirmwarePayload::IntelHex(text)
                } else {
                    FirmwarePayload::Raw(bytes)
                });
            }
            "bootloader" => bootloader = Some(read_bytes(field).await?),
            // Unknown fields are ignored.
            _ => {}
        }
    }

    let version = version.ok_or_else(|| {
        fail(FleetError::Serialisation("missing 'version' field".to_owned()))
    })?;
    let payload = payload.ok_or_else(|| {
        fail(FleetError::Serialisation("missing 'firmware' file".to_owned()))
    })?;

    info!(version = %version, org = %org.id, "uploading firmware via API");

    let firmware = state
        .rollout
        .upload_firmware(
            &org.id,
            FirmwareUpload {
                version,
                firmware_type,
                description,
                payload,
                bootloader,
            },
        )
        .await
        .map_err(fail)?;

    Ok((StatusCode::CREATED, Json(firmware)))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| fail(FleetError::Serialisation(format!("bad multipart field: {e}"))))
}

async fn read_bytes(field: axum::extract::multipart::Field<'_>) -> Result<Bytes, ApiError> {
    field
        .bytes()
        .await
        .map_err(|e| fail(FleetError::Serialisation(format!("bad multipart field: {e}"))))
}

/// List the caller's firmware catalog.
pub async fn list_firmware(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Firmware>>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let images = state.rollout.list_firmware(&org.id).await.map_err(fail)?;
    Ok(Json(images))
}

/// Get one firmware record.
pub async fn get_firmware(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(firmware_id): Path<String>,
) -> Result<Json<Firmware>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let firmware = state
        .rollout
        .get_firmware(&org.id, &FirmwareId::new(firmware_id))
        .await
        .map_err(fail)?;
    Ok(Json(firmware))
}

/// Firmware type change payload.
#[derive(Debug, Deserialize)]
pub struct UpdateFirmwareTypeRequest {
    /// New release channel.
    pub firmware_type: FirmwareType,
}

/// Change a firmware's release channel.
pub async fn update_firmware_type(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(firmware_id): Path<String>,
    Json(request): Json<UpdateFirmwareTypeRequest>,
) -> Result<Json<Firmware>, ApiError> {
    let org = require_org(&state, &headers).await?;
    let firmware = state
        .rollout
        .set_firmware_type(
            &org.id,
            &FirmwareId::new(firmware_id),
            request.firmware_type,
        )
        .await
        .map_err(fail)?;
    Ok(Json(firmware))
}

/// Download a firmware artifact, honouring `Range: bytes=a-b` requests.
///
/// Full downloads answer 200 with the artifact; ranged downloads answer 206
/// with a `Content-Range` header and exactly the requested inclusive span.
/// Invalid ranges are rejected with 416 before any bytes are read.
pub async fn download_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((firmware_id, kind)): Path<(String, String)>,
) -> Result<(StatusCode, HeaderMap, Bytes), ApiError> {
    let org = require_org(&state, &headers).await?;

    let kind: ArtifactKind = kind
        .parse()
        .map_err(|e: String| fail(FleetError::Serialisation(e)))?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let download = state
        .rollout
        .download_artifact(&org.id, &FirmwareId::new(firmware_id), kind, range)
        .await
        .map_err(fail)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    match download.served_range {
        Some(range) => {
            let content_range =
                format!("bytes {}-{}/{}", range.start, range.end, download.total_size);
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&content_range)
                    .map_err(|e| fail(FleetError::internal(e.to_string())))?,
            );
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, download.bytes))
        }
        None => Ok((StatusCode::OK, response_headers, download.bytes)),
    }
}

/// Parse a `bytes=a-b` range header into a [`RangeSpec`].
///
/// Only single ranges are supported; a header that doesn't parse is treated
/// as absent (the full artifact is served), per RFC 9110's permission to
/// ignore malformed Range headers.
fn parse_range_header(value: &str) -> Option<RangeSpec> {
    let spec = value.strip_prefix("bytes=")?.split(',').next()?.trim();
    let (start, end) = spec.split_once('-')?;

    let parse = |s: &str| -> Option<Option<u64>> {
        if s.is_empty() {
            Some(None)
        } else {
            s.parse().ok().map(Some)
        }
    };

    let start = parse(start)?;
    let end = parse(end)?;

    // "bytes=-" carries no bounds at all.
    if start.is_none() && end.is_none() {
        return None;
    }

    Some(RangeSpec { start, end })
}

/// Request to steer a device to a target firmware.
#[derive(Debug, Deserialize)]
pub struct AssignFirmwareRequest {
    /// Firmware to converge to.
    #[serde(rename = "firmwareID")]
    pub firmware_id: FirmwareId,
    /// Expected version string; must match the firmware record.
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: String,
}

/// Assign a target firmware to a device.
pub async fn assign_firmware(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<i64>,
    Json(request): Json<AssignFirmwareRequest>,
) -> Result<Json<Device>, ApiError> {
    let org = require_org(&state, &headers).await?;

    let device = state
        .rollout
        .assign_target(
            &org.id,
            device_id,
            &request.firmware_id,
            &request.firmware_version,
        )
        .await
        .map_err(fail)?;

    Ok(Json(device))
}
