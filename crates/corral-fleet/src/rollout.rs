//! Firmware rollout state machine.
//!
//! Tracks desired vs. actual firmware per device. A management client
//! assigns a target firmware; the device polls its status, downloads the
//! binary (resumably, via byte ranges), and reports back through the
//! registry. The download state follows one automatic rule: assigning a
//! target equal to the current firmware is `updated`, anything else is
//! `pending`.

use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::info;

use crate::error::{FleetError, FleetResult};
use crate::image;
use crate::storage::artifact_path;
use crate::store::FleetStore;
use crate::types::{
    ArtifactKind, ConfigSnapshot, Device, DeviceStatus, Firmware, FirmwareDownload,
    FirmwareDownloadState, FirmwareId, FirmwareType, OrgId, DEFAULT_CRC, UNKNOWN_VERSION,
};

/// Build the uniform device status projection.
///
/// Combines the latest config snapshot's delivery flag, the device's file
/// download flag, and the target firmware descriptor. Every endpoint that
/// reports device status goes through this one function so the shape never
/// drifts between endpoints.
pub async fn device_status(
    store: &dyn FleetStore,
    device: &Device,
    latest_config: Option<&ConfigSnapshot>,
) -> FleetResult<DeviceStatus> {
    let target = match &device.target_firmware {
        Some(id) => store.get_firmware_by_id(id).await?,
        None => None,
    };

    let firmware_download = match target {
        Some(firmware) => FirmwareDownload {
            state: device.firmware_download_state,
            version: firmware.version,
            fwcrc: firmware.crc32,
            size: firmware.size,
        },
        None => FirmwareDownload {
            state: device.firmware_download_state,
            version: UNKNOWN_VERSION.to_owned(),
            fwcrc: DEFAULT_CRC.to_owned(),
            size: 0,
        },
    };

    Ok(DeviceStatus {
        config_updated: latest_config.is_some_and(|s| s.config_updated),
        file_download_state: device.file_download_state,
        firmware_download,
    })
}

/// A firmware payload as uploaded.
#[derive(Debug, Clone)]
pub enum FirmwarePayload {
    /// Raw binary image, stored and checksummed as-is.
    Raw(Bytes),
    /// Intel HEX source; converted to a binary image before checksumming.
    /// Both the image and the original source are stored.
    IntelHex(String),
}

/// Request to add a firmware image to an organisation's catalog.
#[derive(Debug, Clone)]
pub struct FirmwareUpload {
    /// Version string, unique within the organisation.
    pub version: String,
    /// Release channel.
    pub firmware_type: FirmwareType,
    /// Optional release description.
    pub description: Option<String>,
    /// The firmware payload.
    pub payload: FirmwarePayload,
    /// Optional bootloader image, stored verbatim.
    pub bootloader: Option<Bytes>,
}

/// A requested byte range with optional bounds.
///
/// A missing start defaults to 0; a missing end defaults to the last byte of
/// the artifact. Bounds are resolved against the stored size before any
/// bytes are fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeSpec {
    /// First byte offset, if bounded.
    pub start: Option<u64>,
    /// Last byte offset (inclusive), if bounded.
    pub end: Option<u64>,
}

/// An inclusive byte range of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

/// A downloaded artifact (full or partial).
#[derive(Debug, Clone)]
pub struct ArtifactDownload {
    /// The requested bytes.
    pub bytes: Bytes,
    /// Total size of the stored artifact, regardless of range.
    pub total_size: u64,
    /// The served inclusive range, when this was a range request.
    pub served_range: Option<ByteRange>,
}

/// Orchestrates firmware catalog operations and rollout state.
pub struct RolloutEngine {
    store: Arc<dyn FleetStore>,
    blobs: Arc<dyn ObjectStore>,
}

impl RolloutEngine {
    /// Create a new rollout engine.
    pub fn new(store: Arc<dyn FleetStore>, blobs: Arc<dyn ObjectStore>) -> Self {
        Self { store, blobs }
    }

    /// Assign a target firmware to a device.
    ///
    /// The firmware must exist in the device's organisation under exactly
    /// this ID and version pair. Assigning the firmware the device already
    /// runs sets the download state to `updated`; anything else sets
    /// `pending`. This is the sole automatic state transition.
    pub async fn assign_target(
        &self,
        org: &OrgId,
        device_id: i64,
        firmware_id: &FirmwareId,
        version: &str,
    ) -> FleetResult<Device> {
        let mut device = self
            .store
            .get_device_in_org(org, device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;

        let firmware = self
            .store
            .get_firmware(org, firmware_id)
            .await?
            .filter(|f| f.version == version)
            .ok_or_else(|| {
                FleetError::not_found(
                    "firmware",
                    format!("id {firmware_id} with version '{version}'"),
                )
            })?;

        device.target_firmware = Some(firmware.id.clone());
        device.firmware_download_state = if device.current_firmware.as_ref() == Some(&firmware.id)
        {
            FirmwareDownloadState::Updated
        } else {
            FirmwareDownloadState::Pending
        };
        device.updated_at = chrono::Utc::now();

        self.store.update_device(&device).await?;

        info!(
            device_id,
            firmware = %firmware.id,
            version = %firmware.version,
            state = %device.firmware_download_state,
            "target firmware assigned"
        );

        Ok(device)
    }

    /// Upload a firmware image into an organisation's catalog.
    ///
    /// The binary image (converted from HEX when necessary) is checksummed
    /// with CRC32 and written to blob storage before the catalog row is
    /// inserted, so a crash mid-upload cannot leave a row pointing at a
    /// missing blob. An orphaned blob without a row is possible and simply
    /// unreferenced.
    pub async fn upload_firmware(
        &self,
        org: &OrgId,
        upload: FirmwareUpload,
    ) -> FleetResult<Firmware> {
        if self
            .store
            .find_firmware_by_version(org, &upload.version)
            .await?
            .is_some()
        {
            return Err(FleetError::conflict(format!(
                "firmware version '{}' already exists for this organisation",
                upload.version
            )));
        }

        let (bin, hex_source) = match upload.payload {
            FirmwarePayload::Raw(bytes) => (bytes, None),
            FirmwarePayload::IntelHex(text) => {
                let bin = Bytes::from(image::binary_image(&text)?);
                (bin, Some(text))
            }
        };

        let crc32 = format!("{:08x}", crc32fast::hash(&bin));
        let size = bin.len() as i64;

        let bin_path = artifact_path(org, ArtifactKind::Bin, &upload.version);
        self.blobs.put(&bin_path, bin.into()).await?;

        let hex_path = match hex_source {
            Some(text) => {
                let path = artifact_path(org, ArtifactKind::Hex, &upload.version);
                self.blobs.put(&path, Bytes::from(text).into()).await?;
                Some(path.to_string())
            }
            None => None,
        };

        let bootloader_path = match upload.bootloader {
            Some(bytes) => {
                let path = artifact_path(org, ArtifactKind::Bootloader, &upload.version);
                self.blobs.put(&path, bytes.into()).await?;
                Some(path.to_string())
            }
            None => None,
        };

        let firmware = Firmware {
            id: FirmwareId::generate(),
            org_id: org.clone(),
            version: upload.version,
            firmware_type: upload.firmware_type,
            description: upload.description,
            crc32,
            size,
            bin_path: bin_path.to_string(),
            hex_path,
            bootloader_path,
            created_at: chrono::Utc::now(),
        };

        self.store.insert_firmware(&firmware).await?;

        info!(
            firmware = %firmware.id,
            version = %firmware.version,
            crc32 = %firmware.crc32,
            size = firmware.size,
            "firmware uploaded"
        );

        Ok(firmware)
    }

    /// Download a stored firmware artifact, optionally as a byte range.
    ///
    /// Range semantics are inclusive: `start..=end`, validated against
    /// `0 <= start <= end < size` before any bytes are fetched.
    pub async fn download_artifact(
        &self,
        org: &OrgId,
        firmware_id: &FirmwareId,
        kind: ArtifactKind,
        range: Option<RangeSpec>,
    ) -> FleetResult<ArtifactDownload> {
        let firmware = self
            .store
            .get_firmware(org, firmware_id)
            .await?
            .ok_or_else(|| FleetError::not_found("firmware", format!("id {firmware_id}")))?;

        let path = firmware.artifact_path(kind).ok_or_else(|| {
            FleetError::not_found(
                "firmware artifact",
                format!("no {kind} artifact for version '{}'", firmware.version),
            )
        })?;
        let path = Path::from(path);

        match range {
            None => {
                let result = self
                    .blobs
                    .get(&path)
                    .await
                    .map_err(|e| blob_error(e, &path))?;
                let total_size = result.meta.size as u64;
                let bytes = result.bytes().await?;

                Ok(ArtifactDownload {
                    bytes,
                    total_size,
                    served_range: None,
                })
            }
            Some(spec) => {
                let meta = self
                    .blobs
                    .head(&path)
                    .await
                    .map_err(|e| blob_error(e, &path))?;
                let total_size = meta.size as u64;

                let start = spec.start.unwrap_or(0);
                let end = spec.end.unwrap_or(total_size.saturating_sub(1));

                if total_size == 0 || start > end || end >= total_size {
                    return Err(FleetError::RangeNotSatisfiable(format!(
                        "requested bytes {start}-{end} of {total_size}"
                    )));
                }

                let bytes = self
                    .blobs
                    .get_range(&path, start as usize..(end + 1) as usize)
                    .await
                    .map_err(|e| blob_error(e, &path))?;

                Ok(ArtifactDownload {
                    bytes,
                    total_size,
                    served_range: Some(ByteRange { start, end }),
                })
            }
        }
    }

    /// Change a firmware's release channel, the only mutable firmware field.
    pub async fn set_firmware_type(
        &self,
        org: &OrgId,
        firmware_id: &FirmwareId,
        firmware_type: FirmwareType,
    ) -> FleetResult<Firmware> {
        self.store
            .set_firmware_type(org, firmware_id, firmware_type)
            .await?;

        self.store
            .get_firmware(org, firmware_id)
            .await?
            .ok_or_else(|| FleetError::not_found("firmware", format!("id {firmware_id}")))
    }

    /// Get a firmware by ID within an organisation.
    pub async fn get_firmware(
        &self,
        org: &OrgId,
        firmware_id: &FirmwareId,
    ) -> FleetResult<Firmware> {
        self.store
            .get_firmware(org, firmware_id)
            .await?
            .ok_or_else(|| FleetError::not_found("firmware", format!("id {firmware_id}")))
    }

    /// Get a firmware by version within an organisation.
    pub async fn get_firmware_by_version(
        &self,
        org: &OrgId,
        version: &str,
    ) -> FleetResult<Firmware> {
        self.store
            .find_firmware_by_version(org, version)
            .await?
            .ok_or_else(|| FleetError::not_found("firmware", format!("version '{version}'")))
    }

    /// List an organisation's firmware catalog, newest first.
    pub async fn list_firmware(&self, org: &OrgId) -> FleetResult<Vec<Firmware>> {
        self.store.list_firmware(org).await
    }
}

impl std::fmt::Debug for RolloutEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutEngine").finish_non_exhaustive()
    }
}

/// Map blob-store errors, surfacing missing blobs as not-found.
fn blob_error(e: object_store::Error, path: &Path) -> FleetError {
    match e {
        object_store::Error::NotFound { .. } => {
            FleetError::not_found("firmware artifact", format!("blob {path}"))
        }
        other => FleetError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Device, DeviceKey, DeviceUid, Organisation, Profile, ProfileId, Slots};
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: RolloutEngine,
        org: Organisation,
        device: Device,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let blobs: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let engine = RolloutEngine::new(store.clone(), blobs);

        let org = Organisation::new("acme");
        store.insert_org(&org).await.unwrap();

        let profile = Profile {
            id: ProfileId::generate(),
            org_id: org.id.clone(),
            name: "soil-sensor".to_owned(),
            description: None,
            field_names: Slots::new(),
            metadata_names: Slots::new(),
            config_names: Slots::new(),
            created_at: Utc::now(),
        };
        store.insert_profile(&profile).await.unwrap();

        let now = Utc::now();
        let device = Device {
            uid: DeviceUid::generate(),
            device_id: 1,
            name: "dev-1".to_owned(),
            readkey: DeviceKey::generate(),
            writekey: DeviceKey::generate(),
            profile_id: profile.id.clone(),
            current_firmware: None,
            previous_firmware: None,
            target_firmware: None,
            firmware_download_state: FirmwareDownloadState::Updated,
            file_download_state: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_device(&device).await.unwrap();

        Fixture {
            store,
            engine,
            org,
            device,
        }
    }

    fn raw_upload(version: &str, payload: &[u8]) -> FirmwareUpload {
        FirmwareUpload {
            version: version.to_owned(),
            firmware_type: FirmwareType::Beta,
            description: None,
            payload: FirmwarePayload::Raw(Bytes::copy_from_slice(payload)),
            bootloader: None,
        }
    }

    #[tokio::test]
    async fn upload_computes_crc_over_stored_bytes() {
        let f = fixture().await;
        let payload = b"firmware image contents";

        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", payload))
            .await
            .unwrap();

        assert_eq!(firmware.crc32, format!("{:08x}", crc32fast::hash(payload)));
        assert_eq!(firmware.size, payload.len() as i64);
        assert!(firmware.hex_path.is_none());

        let download = f
            .engine
            .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Bin, None)
            .await
            .unwrap();
        assert_eq!(&download.bytes[..], payload);
        assert_eq!(download.total_size, payload.len() as u64);
        assert_eq!(
            firmware.crc32,
            format!("{:08x}", crc32fast::hash(&download.bytes))
        );
    }

    #[tokio::test]
    async fn hex_upload_stores_both_artifacts_and_checksums_the_bin() {
        let f = fixture().await;
        // 01 02 03 04 followed by a gap, then AA BB at offset 6.
        let hex = ":0400000001020304F2\n:02000600AABB93\n:00000001FF";
        let expected_bin = [0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xAA, 0xBB];

        let upload = FirmwareUpload {
            version: "2.0.0".to_owned(),
            firmware_type: FirmwareType::Beta,
            description: None,
            payload: FirmwarePayload::IntelHex(hex.to_owned()),
            bootloader: None,
        };
        let firmware = f.engine.upload_firmware(&f.org.id, upload).await.unwrap();

        assert_eq!(firmware.size, expected_bin.len() as i64);
        assert_eq!(
            firmware.crc32,
            format!("{:08x}", crc32fast::hash(&expected_bin))
        );
        assert!(firmware.hex_path.is_some());

        let bin = f
            .engine
            .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Bin, None)
            .await
            .unwrap();
        assert_eq!(&bin.bytes[..], expected_bin);

        let hex_artifact = f
            .engine
            .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Hex, None)
            .await
            .unwrap();
        assert_eq!(&hex_artifact.bytes[..], hex.as_bytes());
    }

    #[tokio::test]
    async fn duplicate_version_is_conflict() {
        let f = fixture().await;
        f.engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"a"))
            .await
            .unwrap();

        let result = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"b"))
            .await;
        assert!(matches!(result, Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn assign_differing_target_is_pending() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.1.0", b"new"))
            .await
            .unwrap();

        let device = f
            .engine
            .assign_target(&f.org.id, f.device.device_id, &firmware.id, "1.1.0")
            .await
            .unwrap();

        assert_eq!(device.target_firmware.as_ref(), Some(&firmware.id));
        assert_eq!(
            device.firmware_download_state,
            FirmwareDownloadState::Pending
        );
    }

    #[tokio::test]
    async fn assign_current_target_is_updated() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.1.0", b"new"))
            .await
            .unwrap();

        let mut device = f.device.clone();
        device.current_firmware = Some(firmware.id.clone());
        f.store.update_device(&device).await.unwrap();

        let device = f
            .engine
            .assign_target(&f.org.id, device.device_id, &firmware.id, "1.1.0")
            .await
            .unwrap();

        assert_eq!(
            device.firmware_download_state,
            FirmwareDownloadState::Updated
        );
    }

    #[tokio::test]
    async fn assign_with_version_mismatch_is_not_found() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.1.0", b"new"))
            .await
            .unwrap();

        let result = f
            .engine
            .assign_target(&f.org.id, f.device.device_id, &firmware.id, "9.9.9")
            .await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cross_tenant_assign_reports_device_not_found() {
        let f = fixture().await;
        let other_org = Organisation::new("globex");
        f.store.insert_org(&other_org).await.unwrap();

        let firmware = f
            .engine
            .upload_firmware(&other_org.id, raw_upload("1.0.0", b"x"))
            .await
            .unwrap();

        let result = f
            .engine
            .assign_target(&other_org.id, f.device.device_id, &firmware.id, "1.0.0")
            .await;
        assert!(matches!(
            result,
            Err(FleetError::NotFound { entity: "device", .. })
        ));
    }

    #[tokio::test]
    async fn full_range_equals_full_download() {
        let f = fixture().await;
        let payload = b"0123456789abcdef";
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", payload))
            .await
            .unwrap();

        let full = f
            .engine
            .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Bin, None)
            .await
            .unwrap();

        let ranged = f
            .engine
            .download_artifact(
                &f.org.id,
                &firmware.id,
                ArtifactKind::Bin,
                Some(RangeSpec {
                    start: Some(0),
                    end: Some(payload.len() as u64 - 1),
                }),
            )
            .await
            .unwrap();

        assert_eq!(full.bytes, ranged.bytes);
        assert_eq!(ranged.total_size, payload.len() as u64);
        assert_eq!(
            ranged.served_range,
            Some(ByteRange {
                start: 0,
                end: payload.len() as u64 - 1
            })
        );
    }

    #[tokio::test]
    async fn open_ended_range_runs_to_last_byte() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"0123456789"))
            .await
            .unwrap();

        let tail = f
            .engine
            .download_artifact(
                &f.org.id,
                &firmware.id,
                ArtifactKind::Bin,
                Some(RangeSpec {
                    start: Some(6),
                    end: None,
                }),
            )
            .await
            .unwrap();

        assert_eq!(&tail.bytes[..], b"6789");
        assert_eq!(tail.served_range, Some(ByteRange { start: 6, end: 9 }));
    }

    #[tokio::test]
    async fn partial_range_is_inclusive() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"0123456789"))
            .await
            .unwrap();

        let chunk = f
            .engine
            .download_artifact(
                &f.org.id,
                &firmware.id,
                ArtifactKind::Bin,
                Some(RangeSpec {
                    start: Some(2),
                    end: Some(5),
                }),
            )
            .await
            .unwrap();

        assert_eq!(&chunk.bytes[..], b"2345");
        assert_eq!(chunk.total_size, 10);
    }

    #[tokio::test]
    async fn invalid_ranges_are_rejected() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"0123456789"))
            .await
            .unwrap();

        for range in [
            RangeSpec {
                start: Some(5),
                end: Some(2),
            },
            RangeSpec {
                start: Some(0),
                end: Some(10),
            },
            RangeSpec {
                start: Some(10),
                end: Some(10),
            },
        ] {
            let result = f
                .engine
                .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Bin, Some(range))
                .await;
            assert!(
                matches!(result, Err(FleetError::RangeNotSatisfiable(_))),
                "range {range:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn missing_artifact_kind_is_not_found() {
        let f = fixture().await;
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("1.0.0", b"raw only"))
            .await
            .unwrap();

        let result = f
            .engine
            .download_artifact(&f.org.id, &firmware.id, ArtifactKind::Bootloader, None)
            .await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn status_defaults_without_target() {
        let f = fixture().await;

        let status = device_status(f.store.as_ref(), &f.device, None)
            .await
            .unwrap();

        assert!(!status.config_updated);
        assert_eq!(status.firmware_download.version, UNKNOWN_VERSION);
        assert_eq!(status.firmware_download.fwcrc, DEFAULT_CRC);
        assert_eq!(status.firmware_download.size, 0);
    }

    #[tokio::test]
    async fn status_reflects_target_firmware() {
        let f = fixture().await;
        let payload = b"image";
        let firmware = f
            .engine
            .upload_firmware(&f.org.id, raw_upload("3.0.0", payload))
            .await
            .unwrap();

        let device = f
            .engine
            .assign_target(&f.org.id, f.device.device_id, &firmware.id, "3.0.0")
            .await
            .unwrap();

        let status = device_status(f.store.as_ref(), &device, None).await.unwrap();
        assert_eq!(status.firmware_download.version, "3.0.0");
        assert_eq!(status.firmware_download.fwcrc, firmware.crc32);
        assert_eq!(status.firmware_download.size, payload.len() as i64);
        assert_eq!(
            status.firmware_download.state,
            FirmwareDownloadState::Pending
        );
    }
}
