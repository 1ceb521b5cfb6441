//! Device registry and profile data access.
//!
//! Devices are created by management action: uniqueness and
//! profile-ownership checks happen before anything is written. Devices are
//! never hard-deleted; config and firmware operations and device
//! self-reports mutate them afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FleetError, FleetResult};
use crate::store::FleetStore;
use crate::types::{
    ConfigKind, Device, DeviceKey, DeviceUid, FieldKind, FirmwareDownloadState, FirmwareId,
    MetadataKind, OrgId, Organisation, Profile, ProfileId, Slots,
};

/// How many history rows the detailed device view includes per ledger.
const HISTORY_LIMIT: u32 = 100;

/// Request to register a new device.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeviceRequest {
    /// Device name, unique fleet-wide.
    pub name: String,
    /// Profile the device belongs to; must be owned by the caller's
    /// organisation.
    pub profile_id: ProfileId,
    /// Firmware the device is known to run already, if any.
    #[serde(default)]
    pub current_firmware: Option<FirmwareId>,
    /// Previously run firmware, if any.
    #[serde(default)]
    pub previous_firmware: Option<FirmwareId>,
    /// Initial target firmware, if any.
    #[serde(default)]
    pub target_firmware: Option<FirmwareId>,
    /// Initial rollout state; defaults to `updated`.
    #[serde(default)]
    pub firmware_download_state: Option<FirmwareDownloadState>,
    /// Initial file download flag; defaults to `false`.
    #[serde(default)]
    pub file_download_state: Option<bool>,
}

/// Partial device update.
///
/// A field only overwrites when it is present and non-empty, with one
/// exception: `file_download_state` is overwritten by any explicit value,
/// including `false`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDeviceRequest {
    /// New device name.
    #[serde(default)]
    pub name: Option<String>,
    /// Move the device to another profile.
    #[serde(default)]
    pub profile_id: Option<ProfileId>,
    /// Device-reported current firmware.
    #[serde(default)]
    pub current_firmware: Option<FirmwareId>,
    /// Device-reported previous firmware.
    #[serde(default)]
    pub previous_firmware: Option<FirmwareId>,
    /// Target firmware pointer.
    #[serde(default)]
    pub target_firmware: Option<FirmwareId>,
    /// Rollout state (devices report `failed` through this).
    #[serde(default)]
    pub firmware_download_state: Option<FirmwareDownloadState>,
    /// File download flag; `Some(false)` overwrites.
    #[serde(default)]
    pub file_download_state: Option<bool>,
}

/// Request to create a profile.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProfileRequest {
    /// Profile name, unique within the organisation.
    pub name: String,
    /// Optional free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Names for the telemetry field slots.
    #[serde(default)]
    pub field_names: Slots<FieldKind>,
    /// Names for the metadata slots.
    #[serde(default)]
    pub metadata_names: Slots<MetadataKind>,
    /// Names for the config slots.
    #[serde(default)]
    pub config_names: Slots<ConfigKind>,
}

/// One device in an organisation's device list.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Device name.
    pub name: String,
    /// Read credential.
    pub readkey: String,
    /// Write credential.
    pub writekey: String,
    /// Profile the device belongs to.
    pub profile: ProfileId,
    /// Profile name, when the profile still resolves.
    pub profile_name: Option<String>,
    /// Resolved current firmware version.
    #[serde(rename = "currentFirmwareVersion")]
    pub current_firmware_version: Option<String>,
    /// Resolved previous firmware version.
    #[serde(rename = "previousFirmwareVersion")]
    pub previous_firmware_version: Option<String>,
    /// Resolved target firmware version.
    #[serde(rename = "targetFirmwareVersion")]
    pub target_firmware_version: Option<String>,
    /// File download flag.
    #[serde(rename = "fileDownloadState")]
    pub file_download_state: bool,
    /// Rollout state.
    #[serde(rename = "firmwareDownloadState")]
    pub firmware_download_state: FirmwareDownloadState,
    /// When the device last posted telemetry.
    pub last_posted_time: Option<DateTime<Utc>>,
    /// When the device was registered.
    pub created_at: DateTime<Utc>,
}

/// One config history row in the detailed device view.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigHistoryEntry {
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
    /// Delivery flag.
    pub config_updated: bool,
    /// Masked slot values.
    pub configs: Slots<ConfigKind>,
}

/// One metadata history row in the detailed device view.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataHistoryEntry {
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
    /// Masked slot values.
    pub metadata: Slots<MetadataKind>,
}

/// One telemetry history row in the detailed device view.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryHistoryEntry {
    /// Per-device sequence number.
    #[serde(rename = "entryID")]
    pub entry_id: i64,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
    /// Masked field values.
    pub fields: Slots<FieldKind>,
}

/// Detailed device view: the device row, its profile's active slot names,
/// and recent history from all three ledgers.
#[derive(Debug, Serialize)]
pub struct DeviceDetail {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Device name.
    pub name: String,
    /// Read credential.
    pub readkey: String,
    /// Write credential.
    pub writekey: String,
    /// Profile the device belongs to.
    pub profile: ProfileId,
    /// Profile name.
    pub profile_name: Option<String>,
    /// Resolved current firmware version.
    #[serde(rename = "currentFirmwareVersion")]
    pub current_firmware_version: Option<String>,
    /// Resolved previous firmware version.
    #[serde(rename = "previousFirmwareVersion")]
    pub previous_firmware_version: Option<String>,
    /// Resolved target firmware version.
    #[serde(rename = "targetFirmwareVersion")]
    pub target_firmware_version: Option<String>,
    /// File download flag.
    #[serde(rename = "fileDownloadState")]
    pub file_download_state: bool,
    /// Rollout state.
    #[serde(rename = "firmwareDownloadState")]
    pub firmware_download_state: FirmwareDownloadState,
    /// When the device was registered.
    pub created_at: DateTime<Utc>,
    /// Recent config history, newest first.
    pub config_history: Vec<ConfigHistoryEntry>,
    /// Recent metadata history, newest first.
    pub metadata_history: Vec<MetadataHistoryEntry>,
    /// Recent telemetry history, newest first.
    pub telemetry_history: Vec<TelemetryHistoryEntry>,
    /// Active telemetry slot names.
    pub field_names: Slots<FieldKind>,
    /// Active config slot names.
    pub config_names: Slots<ConfigKind>,
    /// Active metadata slot names.
    pub metadata_names: Slots<MetadataKind>,
}

/// Device and profile registry operations.
pub struct DeviceRegistry {
    store: Arc<dyn FleetStore>,
}

impl DeviceRegistry {
    /// Create a new registry.
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Create an organisation with a generated capability token.
    pub async fn create_organisation(&self, name: impl Into<String>) -> FleetResult<Organisation> {
        let org = Organisation::new(name);
        self.store.insert_org(&org).await?;
        info!(org = %org.id, "organisation created");
        Ok(org)
    }

    /// Create a profile in an organisation.
    pub async fn create_profile(
        &self,
        org: &OrgId,
        request: CreateProfileRequest,
    ) -> FleetResult<Profile> {
        let profile = Profile {
            id: ProfileId::generate(),
            org_id: org.clone(),
            name: request.name,
            description: request.description,
            field_names: request.field_names,
            metadata_names: request.metadata_names,
            config_names: request.config_names,
            created_at: Utc::now(),
        };

        self.store.insert_profile(&profile).await?;
        info!(profile = %profile.id, org = %org, "profile created");
        Ok(profile)
    }

    /// Get a profile, constrained to the caller's organisation.
    pub async fn get_profile(&self, org: &OrgId, id: &ProfileId) -> FleetResult<Profile> {
        self.store
            .get_profile(id)
            .await?
            .filter(|p| &p.org_id == org)
            .ok_or_else(|| FleetError::not_found("profile", format!("id {id}")))
    }

    /// List an organisation's profiles.
    pub async fn list_profiles(&self, org: &OrgId) -> FleetResult<Vec<Profile>> {
        self.store.list_profiles(org).await
    }

    /// Register a new device.
    ///
    /// Rejects a duplicate name, verifies the profile belongs to the
    /// caller's organisation, then assigns the next sequential device ID and
    /// two freshly generated credentials. All checks run before the insert;
    /// the store's uniqueness constraints catch concurrent races.
    pub async fn create_device(
        &self,
        org: &OrgId,
        request: CreateDeviceRequest,
    ) -> FleetResult<Device> {
        if self
            .store
            .find_device_by_name(&request.name)
            .await?
            .is_some()
        {
            return Err(FleetError::conflict(format!(
                "device name '{}' already exists",
                request.name
            )));
        }

        let profile = self
            .store
            .get_profile(&request.profile_id)
            .await?
            .ok_or_else(|| {
                FleetError::not_found("profile", format!("id {}", request.profile_id))
            })?;
        if &profile.org_id != org {
            return Err(FleetError::forbidden(
                "profile does not belong to your organisation",
            ));
        }

        let device_id = self.store.next_device_id().await?;
        let now = Utc::now();
        let device = Device {
            uid: DeviceUid::generate(),
            device_id,
            name: request.name,
            readkey: DeviceKey::generate(),
            writekey: DeviceKey::generate(),
            profile_id: request.profile_id,
            current_firmware: request.current_firmware,
            previous_firmware: request.previous_firmware,
            target_firmware: request.target_firmware,
            firmware_download_state: request.firmware_download_state.unwrap_or_default(),
            file_download_state: request.file_download_state.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_device(&device).await?;
        info!(device_id, name = %device.name, "device created");
        Ok(device)
    }

    /// Partially update a device.
    pub async fn update_device(
        &self,
        org: &OrgId,
        device_id: i64,
        request: UpdateDeviceRequest,
    ) -> FleetResult<Device> {
        let mut device = self
            .store
            .get_device_in_org(org, device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;

        if let Some(name) = request.name.filter(|n| !n.is_empty()) {
            if name != device.name {
                if self.store.find_device_by_name(&name).await?.is_some() {
                    return Err(FleetError::conflict(format!(
                        "device name '{name}' already exists"
                    )));
                }
                device.name = name;
            }
        }

        if let Some(profile_id) = request.profile_id {
            let profile = self
                .store
                .get_profile(&profile_id)
                .await?
                .ok_or_else(|| {
                    FleetError::not_found("profile", format!("id {profile_id}"))
                })?;
            if &profile.org_id != org {
                return Err(FleetError::forbidden(
                    "profile does not belong to your organisation",
                ));
            }
            device.profile_id = profile_id;
        }

        if let Some(id) = request.current_firmware {
            device.current_firmware = Some(id);
        }
        if let Some(id) = request.previous_firmware {
            device.previous_firmware = Some(id);
        }
        if let Some(id) = request.target_firmware {
            device.target_firmware = Some(id);
        }
        if let Some(state) = request.firmware_download_state {
            device.firmware_download_state = state;
        }
        // Boolean exception: an explicit false still overwrites.
        if let Some(flag) = request.file_download_state {
            device.file_download_state = flag;
        }

        device.updated_at = Utc::now();
        self.store.update_device(&device).await?;

        Ok(device)
    }

    /// Get a device's detailed view, constrained to the caller's
    /// organisation. A device in another organisation reports not-found.
    pub async fn get_device(&self, org: &OrgId, device_id: i64) -> FleetResult<DeviceDetail> {
        let device = self
            .store
            .get_device_in_org(org, device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;

        let profile = self.store.get_profile(&device.profile_id).await?;
        let (field_names, config_names, metadata_names) = match &profile {
            Some(p) => (
                p.field_names.clone(),
                p.config_names.clone(),
                p.metadata_names.clone(),
            ),
            None => (Slots::new(), Slots::new(), Slots::new()),
        };

        let config_history = self
            .store
            .list_config_history(device_id, HISTORY_LIMIT)
            .await?
            .into_iter()
            .map(|s| ConfigHistoryEntry {
                created_at: s.created_at,
                config_updated: s.config_updated,
                configs: s.values.masked_by(&config_names),
            })
            .collect();

        let metadata_history = self
            .store
            .list_metadata_history(device_id, HISTORY_LIMIT)
            .await?
            .into_iter()
            .map(|s| MetadataHistoryEntry {
                created_at: s.created_at,
                metadata: s.values.masked_by(&metadata_names),
            })
            .collect();

        let telemetry_history = self
            .store
            .list_telemetry_history(device_id, HISTORY_LIMIT)
            .await?
            .into_iter()
            .map(|e| TelemetryHistoryEntry {
                entry_id: e.entry_id,
                created_at: e.created_at,
                fields: e.values.masked_by(&field_names),
            })
            .collect();

        Ok(DeviceDetail {
            device_id: device.device_id,
            name: device.name,
            readkey: device.readkey.as_str().to_owned(),
            writekey: device.writekey.as_str().to_owned(),
            profile: device.profile_id,
            profile_name: profile.map(|p| p.name),
            current_firmware_version: self
                .firmware_version(device.current_firmware.as_ref())
                .await?,
            previous_firmware_version: self
                .firmware_version(device.previous_firmware.as_ref())
                .await?,
            target_firmware_version: self
                .firmware_version(device.target_firmware.as_ref())
                .await?,
            file_download_state: device.file_download_state,
            firmware_download_state: device.firmware_download_state,
            created_at: device.created_at,
            config_history,
            metadata_history,
            telemetry_history,
            field_names,
            config_names,
            metadata_names,
        })
    }

    /// List an organisation's devices with resolved firmware versions and
    /// last telemetry time.
    pub async fn list_devices(&self, org: &OrgId) -> FleetResult<Vec<DeviceSummary>> {
        let devices = self.store.list_devices(org).await?;

        let mut summaries = Vec::with_capacity(devices.len());
        for device in devices {
            let profile = self.store.get_profile(&device.profile_id).await?;
            let last_posted_time = self
                .store
                .latest_telemetry(device.device_id)
                .await?
                .map(|e| e.created_at);

            summaries.push(DeviceSummary {
                device_id: device.device_id,
                name: device.name,
                readkey: device.readkey.as_str().to_owned(),
                writekey: device.writekey.as_str().to_owned(),
                profile: device.profile_id,
                profile_name: profile.map(|p| p.name),
                current_firmware_version: self
                    .firmware_version(device.current_firmware.as_ref())
                    .await?,
                previous_firmware_version: self
                    .firmware_version(device.previous_firmware.as_ref())
                    .await?,
                target_firmware_version: self
                    .firmware_version(device.target_firmware.as_ref())
                    .await?,
                file_download_state: device.file_download_state,
                firmware_download_state: device.firmware_download_state,
                last_posted_time,
                created_at: device.created_at,
            });
        }

        Ok(summaries)
    }

    async fn firmware_version(&self, id: Option<&FirmwareId>) -> FleetResult<Option<String>> {
        match id {
            Some(id) => Ok(self
                .store
                .get_firmware_by_id(id)
                .await?
                .map(|f| f.version)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: DeviceRegistry,
        org: Organisation,
        profile: Profile,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::new(store.clone());

        let org = registry.create_organisation("acme").await.unwrap();

        let mut config_names = Slots::new();
        config_names.set(0, Some("interval".to_owned()));
        let profile = registry
            .create_profile(
                &org.id,
                CreateProfileRequest {
                    name: "soil-sensor".to_owned(),
                    description: None,
                    field_names: Slots::new(),
                    metadata_names: Slots::new(),
                    config_names,
                },
            )
            .await
            .unwrap();

        Fixture {
            store,
            registry,
            org,
            profile,
        }
    }

    fn create_request(profile: &Profile, name: &str) -> CreateDeviceRequest {
        CreateDeviceRequest {
            name: name.to_owned(),
            profile_id: profile.id.clone(),
            current_firmware: None,
            previous_firmware: None,
            target_firmware: None,
            firmware_download_state: None,
            file_download_state: None,
        }
    }

    #[tokio::test]
    async fn device_ids_are_sequential_from_one() {
        let f = fixture().await;

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let device = f
                .registry
                .create_device(&f.org.id, create_request(&f.profile, name))
                .await
                .unwrap();
            assert_eq!(device.device_id, i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn generated_credentials_are_independent() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        assert_eq!(device.readkey.as_str().len(), 16);
        assert_eq!(device.writekey.as_str().len(), 16);
        assert_ne!(device.readkey, device.writekey);
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let f = fixture().await;
        f.registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        let result = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await;
        assert!(matches!(result, Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn foreign_profile_is_forbidden() {
        let f = fixture().await;
        let other = f.registry.create_organisation("globex").await.unwrap();

        let result = f
            .registry
            .create_device(&other.id, create_request(&f.profile, "dev"))
            .await;
        assert!(matches!(result, Err(FleetError::Forbidden(_))));
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let f = fixture().await;
        let request = CreateDeviceRequest {
            profile_id: ProfileId::generate(),
            ..create_request(&f.profile, "dev")
        };

        let result = f.registry.create_device(&f.org.id, request).await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn partial_update_only_touches_present_fields() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        let updated = f
            .registry
            .update_device(
                &f.org.id,
                device.device_id,
                UpdateDeviceRequest {
                    firmware_download_state: Some(FirmwareDownloadState::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "dev");
        assert_eq!(
            updated.firmware_download_state,
            FirmwareDownloadState::Failed
        );
    }

    #[tokio::test]
    async fn empty_name_does_not_overwrite() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        let updated = f
            .registry
            .update_device(
                &f.org.id,
                device.device_id,
                UpdateDeviceRequest {
                    name: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "dev");
    }

    #[tokio::test]
    async fn explicit_false_file_download_state_overwrites() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(
                &f.org.id,
                CreateDeviceRequest {
                    file_download_state: Some(true),
                    ..create_request(&f.profile, "dev")
                },
            )
            .await
            .unwrap();
        assert!(device.file_download_state);

        let updated = f
            .registry
            .update_device(
                &f.org.id,
                device.device_id,
                UpdateDeviceRequest {
                    file_download_state: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!updated.file_download_state);
    }

    #[tokio::test]
    async fn cross_tenant_read_is_not_found() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        let other = f.registry.create_organisation("globex").await.unwrap();
        let result = f.registry.get_device(&other.id, device.device_id).await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn detail_masks_history_by_profile_names() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        // config1 is named "interval", config2 is inert.
        let mut values = Slots::new();
        values.set(0, Some("60".to_owned()));
        values.set(1, Some("hidden".to_owned()));
        f.store
            .insert_config_snapshot(&crate::types::ConfigSnapshot {
                id: crate::types::SnapshotId::generate(),
                device_id: device.device_id,
                values,
                config_updated: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let detail = f
            .registry
            .get_device(&f.org.id, device.device_id)
            .await
            .unwrap();

        assert_eq!(detail.config_history.len(), 1);
        assert_eq!(detail.config_history[0].configs.get(0), Some("60"));
        assert_eq!(detail.config_history[0].configs.get(1), None);
        assert_eq!(detail.config_names.get(0), Some("interval"));
    }

    #[tokio::test]
    async fn duplicate_profile_name_is_conflict() {
        let f = fixture().await;
        let result = f
            .registry
            .create_profile(
                &f.org.id,
                CreateProfileRequest {
                    name: "soil-sensor".to_owned(),
                    description: None,
                    field_names: Slots::new(),
                    metadata_names: Slots::new(),
                    config_names: Slots::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn list_devices_resolves_versions_and_last_posted() {
        let f = fixture().await;
        let device = f
            .registry
            .create_device(&f.org.id, create_request(&f.profile, "dev"))
            .await
            .unwrap();

        let summaries = f.registry.list_devices(&f.org.id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].device_id, device.device_id);
        assert_eq!(summaries[0].profile_name.as_deref(), Some("soil-sensor"));
        assert!(summaries[0].current_firmware_version.is_none());
        assert!(summaries[0].last_posted_time.is_none());
    }
}
