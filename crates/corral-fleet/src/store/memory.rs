//! In-memory fleet store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{FleetError, FleetResult};
use crate::types::{
    ConfigSnapshot, Device, Firmware, FirmwareId, FirmwareType, MetadataSnapshot, OrgId,
    Organisation, Profile, ProfileId, SnapshotId, TelemetryEntry,
};

use super::FleetStore;

/// In-memory fleet store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orgs: RwLock<HashMap<String, Organisation>>,
    profiles: RwLock<HashMap<String, Profile>>,
    devices: RwLock<HashMap<String, Device>>,
    firmware: RwLock<HashMap<String, Firmware>>,
    configs: RwLock<HashMap<i64, Vec<ConfigSnapshot>>>,
    metadata: RwLock<HashMap<i64, Vec<MetadataSnapshot>>>,
    telemetry: RwLock<HashMap<i64, Vec<TelemetryEntry>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> FleetError {
        FleetError::internal("lock poisoned")
    }
}

/// Newest element of an append-only history, by creation time then
/// insertion order (bulk imports may carry out-of-order timestamps).
fn newest<T, F: Fn(&T) -> chrono::DateTime<chrono::Utc>>(rows: &[T], created: F) -> Option<&T> {
    rows.iter()
        .enumerate()
        .max_by_key(|&(i, row)| (created(row), i))
        .map(|(_, row)| row)
}

/// Newest-first copy of a history, bounded at `limit`.
fn history<T: Clone, F: Fn(&T) -> chrono::DateTime<chrono::Utc>>(
    rows: &[T],
    created: F,
    limit: u32,
) -> Vec<T> {
    let mut out: Vec<(usize, T)> = rows.iter().cloned().enumerate().collect();
    out.sort_by(|(ai, a), (bi, b)| (created(b), bi).cmp(&(created(a), ai)));
    out.into_iter()
        .take(limit as usize)
        .map(|(_, row)| row)
        .collect()
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn insert_org(&self, org: &Organisation) -> FleetResult<()> {
        let mut orgs = self.orgs.write().map_err(|_| Self::poisoned())?;

        if orgs.contains_key(org.id.as_str()) {
            return Err(FleetError::conflict(format!(
                "organisation {} already exists",
                org.id
            )));
        }
        if orgs.values().any(|o| o.token == org.token) {
            return Err(FleetError::conflict("organisation token already in use"));
        }

        orgs.insert(org.id.as_str().to_owned(), org.clone());
        Ok(())
    }

    async fn get_org(&self, id: &OrgId) -> FleetResult<Option<Organisation>> {
        let orgs = self.orgs.read().map_err(|_| Self::poisoned())?;
        Ok(orgs.get(id.as_str()).cloned())
    }

    async fn find_org_by_token(&self, token: &str) -> FleetResult<Option<Organisation>> {
        let orgs = self.orgs.read().map_err(|_| Self::poisoned())?;
        Ok(orgs.values().find(|o| o.token == token).cloned())
    }

    async fn insert_profile(&self, profile: &Profile) -> FleetResult<()> {
        let mut profiles = self.profiles.write().map_err(|_| Self::poisoned())?;

        let duplicate = profiles
            .values()
            .any(|p| p.org_id == profile.org_id && p.name == profile.name);
        if duplicate {
            return Err(FleetError::conflict(format!(
                "profile '{}' already exists in organisation {}",
                profile.name, profile.org_id
            )));
        }

        profiles.insert(profile.id.as_str().to_owned(), profile.clone());
        Ok(())
    }

    async fn get_profile(&self, id: &ProfileId) -> FleetResult<Option<Profile>> {
        let profiles = self.profiles.read().map_err(|_| Self::poisoned())?;
        Ok(profiles.get(id.as_str()).cloned())
    }

    async fn list_profiles(&self, org: &OrgId) -> FleetResult<Vec<Profile>> {
        let profiles = self.profiles.read().map_err(|_| Self::poisoned())?;
        let mut results: Vec<_> = profiles
            .values()
            .filter(|p| &p.org_id == org)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    async fn insert_device(&self, device: &Device) -> FleetResult<()> {
        let mut devices = self.devices.write().map_err(|_| Self::poisoned())?;

        for existing in devices.values() {
            if existing.name == device.name {
                return Err(FleetError::conflict(format!(
                    "device name '{}' already exists",
                    device.name
                )));
            }
            if existing.device_id == device.device_id {
                return Err(FleetError::conflict(format!(
                    "device ID {} already exists",
                    device.device_id
                )));
            }
            if existing.readkey == device.readkey || existing.writekey == device.writekey {
                return Err(FleetError::conflict("device credential already in use"));
            }
        }

        devices.insert(device.uid.as_str().to_owned(), device.clone());
        Ok(())
    }

    async fn get_device(&self, device_id: i64) -> FleetResult<Option<Device>> {
        let devices = self.devices.read().map_err(|_| Self::poisoned())?;
        Ok(devices
            .values()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn get_device_in_org(&self, org: &OrgId, device_id: i64) -> FleetResult<Option<Device>> {
        let device = {
            let devices = self.devices.read().map_err(|_| Self::poisoned())?;
            devices
                .values()
                .find(|d| d.device_id == device_id)
                .cloned()
        };

        let Some(device) = device else {
            return Ok(None);
        };

        let profiles = self.profiles.read().map_err(|_| Self::poisoned())?;
        let owned = profiles
            .get(device.profile_id.as_str())
            .is_some_and(|p| &p.org_id == org);

        Ok(owned.then_some(device))
    }

    async fn find_device_by_name(&self, name: &str) -> FleetResult<Option<Device>> {
        let devices = self.devices.read().map_err(|_| Self::poisoned())?;
        Ok(devices.values().find(|d| d.name == name).cloned())
    }

    async fn find_device_by_writekey(&self, writekey: &str) -> FleetResult<Option<Device>> {
        let devices = self.devices.read().map_err(|_| Self::poisoned())?;
        Ok(devices
            .values()
            .find(|d| d.writekey.as_str() == writekey)
            .cloned())
    }

    async fn next_device_id(&self) -> FleetResult<i64> {
        let devices = self.devices.read().map_err(|_| Self::poisoned())?;
        Ok(devices.values().map(|d| d.device_id).max().unwrap_or(0) + 1)
    }

    async fn update_device(&self, device: &Device) -> FleetResult<()> {
        let mut devices = self.devices.write().map_err(|_| Self::poisoned())?;

        if !devices.contains_key(device.uid.as_str()) {
            return Err(FleetError::not_found(
                "device",
                format!("uid {}", device.uid),
            ));
        }

        devices.insert(device.uid.as_str().to_owned(), device.clone());
        Ok(())
    }

    async fn list_devices(&self, org: &OrgId) -> FleetResult<Vec<Device>> {
        let profile_ids: Vec<String> = {
            let profiles = self.profiles.read().map_err(|_| Self::poisoned())?;
            profiles
                .values()
                .filter(|p| &p.org_id == org)
                .map(|p| p.id.as_str().to_owned())
                .collect()
        };

        let devices = self.devices.read().map_err(|_| Self::poisoned())?;
        let mut results: Vec<_> = devices
            .values()
            .filter(|d| profile_ids.iter().any(|p| p == d.profile_id.as_str()))
            .cloned()
            .collect();
        results.sort_by_key(|d| d.device_id);
        Ok(results)
    }

    async fn insert_firmware(&self, firmware: &Firmware) -> FleetResult<()> {
        let mut images = self.firmware.write().map_err(|_| Self::poisoned())?;

        let duplicate = images
            .values()
            .any(|f| f.org_id == firmware.org_id && f.version == firmware.version);
        if duplicate {
            return Err(FleetError::conflict(format!(
                "firmware version '{}' already exists in organisation {}",
                firmware.version, firmware.org_id
            )));
        }

        images.insert(firmware.id.as_str().to_owned(), firmware.clone());
        Ok(())
    }

    async fn get_firmware(&self, org: &OrgId, id: &FirmwareId) -> FleetResult<Option<Firmware>> {
        let images = self.firmware.read().map_err(|_| Self::poisoned())?;
        Ok(images
            .get(id.as_str())
            .filter(|f| &f.org_id == org)
            .cloned())
    }

    async fn get_firmware_by_id(&self, id: &FirmwareId) -> FleetResult<Option<Firmware>> {
        let images = self.firmware.read().map_err(|_| Self::poisoned())?;
        Ok(images.get(id.as_str()).cloned())
    }

    async fn find_firmware_by_version(
        &self,
        org: &OrgId,
        version: &str,
    ) -> FleetResult<Option<Firmware>> {
        let images = self.firmware.read().map_err(|_| Self::poisoned())?;
        Ok(images
            .values()
            .find(|f| &f.org_id == org && f.version == version)
            .cloned())
    }

    async fn list_firmware(&self, org: &OrgId) -> FleetResult<Vec<Firmware>> {
        let images = self.firmware.read().map_err(|_| Self::poisoned())?;
        let mut results: Vec<_> = images
            .values()
            .filter(|f| &f.org_id == org)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    async fn set_firmware_type(
        &self,
        org: &OrgId,
        id: &FirmwareId,
        firmware_type: FirmwareType,
    ) -> FleetResult<()> {
        let mut images = self.firmware.write().map_err(|_| Self::poisoned())?;

        let firmware = images
            .get_mut(id.as_str())
            .filter(|f| &f.org_id == org)
            .ok_or_else(|| FleetError::not_found("firmware", format!("id {id}")))?;

        firmware.firmware_type = firmware_type;
        Ok(())
    }

    async fn insert_config_snapshot(&self, snapshot: &ConfigSnapshot) -> FleetResult<()> {
        let mut configs = self.configs.write().map_err(|_| Self::poisoned())?;
        configs
            .entry(snapshot.device_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn insert_config_snapshots(&self, snapshots: &[ConfigSnapshot]) -> FleetResult<()> {
        // A single write lock makes the batch atomic here; the PostgreSQL
        // implementation uses a transaction.
        let mut configs = self.configs.write().map_err(|_| Self::poisoned())?;
        for snapshot in snapshots {
            configs
                .entry(snapshot.device_id)
                .or_default()
                .push(snapshot.clone());
        }
        Ok(())
    }

    async fn latest_config(&self, device_id: i64) -> FleetResult<Option<ConfigSnapshot>> {
        let configs = self.configs.read().map_err(|_| Self::poisoned())?;
        Ok(configs
            .get(&device_id)
            .and_then(|rows| newest(rows, |s| s.created_at))
            .cloned())
    }

    async fn acknowledge_config(&self, id: &SnapshotId) -> FleetResult<()> {
        let mut configs = self.configs.write().map_err(|_| Self::poisoned())?;

        for rows in configs.values_mut() {
            if let Some(snapshot) = rows.iter_mut().find(|s| &s.id == id) {
                snapshot.config_updated = true;
                return Ok(());
            }
        }

        Err(FleetError::not_found("config snapshot", format!("id {id}")))
    }

    async fn list_config_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<ConfigSnapshot>> {
        let configs = self.configs.read().map_err(|_| Self::poisoned())?;
        Ok(configs
            .get(&device_id)
            .map(|rows| history(rows, |s| s.created_at, limit))
            .unwrap_or_default())
    }

    async fn insert_metadata_snapshot(&self, snapshot: &MetadataSnapshot) -> FleetResult<()> {
        let mut metadata = self.metadata.write().map_err(|_| Self::poisoned())?;
        metadata
            .entry(snapshot.device_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn latest_metadata(&self, device_id: i64) -> FleetResult<Option<MetadataSnapshot>> {
        let metadata = self.metadata.read().map_err(|_| Self::poisoned())?;
        Ok(metadata
            .get(&device_id)
            .and_then(|rows| newest(rows, |s| s.created_at))
            .cloned())
    }

    async fn list_metadata_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<MetadataSnapshot>> {
        let metadata = self.metadata.read().map_err(|_| Self::poisoned())?;
        Ok(metadata
            .get(&device_id)
            .map(|rows| history(rows, |s| s.created_at, limit))
            .unwrap_or_default())
    }

    async fn insert_telemetry(&self, entry: &TelemetryEntry) -> FleetResult<()> {
        let mut telemetry = self.telemetry.write().map_err(|_| Self::poisoned())?;

        let rows = telemetry.entry(entry.device_id).or_default();
        if rows.iter().any(|e| e.entry_id == entry.entry_id) {
            return Err(FleetError::conflict(format!(
                "entry {} already exists for device {}",
                entry.entry_id, entry.device_id
            )));
        }

        rows.push(entry.clone());
        Ok(())
    }

    async fn insert_telemetry_batch(&self, entries: &[TelemetryEntry]) -> FleetResult<()> {
        let mut telemetry = self.telemetry.write().map_err(|_| Self::poisoned())?;

        for entry in entries {
            let rows = telemetry.entry(entry.device_id).or_default();
            if rows.iter().any(|e| e.entry_id == entry.entry_id) {
                return Err(FleetError::conflict(format!(
                    "entry {} already exists for device {}",
                    entry.entry_id, entry.device_id
                )));
            }
            rows.push(entry.clone());
        }
        Ok(())
    }

    async fn next_entry_id(&self, device_id: i64) -> FleetResult<i64> {
        let telemetry = self.telemetry.read().map_err(|_| Self::poisoned())?;
        Ok(telemetry
            .get(&device_id)
            .and_then(|rows| rows.iter().map(|e| e.entry_id).max())
            .unwrap_or(0)
            + 1)
    }

    async fn latest_telemetry(&self, device_id: i64) -> FleetResult<Option<TelemetryEntry>> {
        let telemetry = self.telemetry.read().map_err(|_| Self::poisoned())?;
        Ok(telemetry
            .get(&device_id)
            .and_then(|rows| newest(rows, |e| e.created_at))
            .cloned())
    }

    async fn list_telemetry_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<TelemetryEntry>> {
        let telemetry = self.telemetry.read().map_err(|_| Self::poisoned())?;
        Ok(telemetry
            .get(&device_id)
            .map(|rows| history(rows, |e| e.created_at, limit))
            .unwrap_or_default())
    }
}
