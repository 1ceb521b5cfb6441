//! Telemetry and metadata ledgers.
//!
//! Both ledgers are append-only time series owned by a device. Telemetry
//! entries carry a per-device `entryID` sequence, independent of the global
//! row ID. Devices submit through their write credential; the management
//! side submits metadata through the organisation scope.
//!
//! Unlike the config path (which stores unnamed slot values and merely hides
//! them on read), device-submitted telemetry and metadata null out slots the
//! profile does not name before storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::rollout::device_status;
use crate::store::FleetStore;
use crate::types::{
    Device, DeviceStatus, FieldKind, MetadataKind, MetadataSnapshot, OrgId, Slots, SnapshotId,
    TelemetryEntry,
};

/// One row of a bulk telemetry import.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkTelemetryRow {
    /// Caller-supplied timestamp; defaults to the time of import.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Field values.
    #[serde(flatten)]
    pub fields: Slots<FieldKind>,
}

/// Latest metadata for a device, with the uniform status projection.
#[derive(Debug, Serialize)]
pub struct MetadataView {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Uniform status projection.
    pub status: DeviceStatus,
    /// Masked metadata values (empty when no snapshot exists).
    pub metadata: Slots<MetadataKind>,
    /// When the latest snapshot was written, if any.
    pub created_at: Option<DateTime<Utc>>,
}

/// Receipt for an org-scoped metadata write.
#[derive(Debug, Serialize)]
pub struct MetadataReceipt {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Uniform status projection, after the write.
    pub status: DeviceStatus,
}

/// Append-only telemetry and metadata operations.
pub struct TelemetryLedger {
    store: Arc<dyn FleetStore>,
}

impl TelemetryLedger {
    /// Create a new ledger.
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Record one telemetry entry submitted by a device.
    ///
    /// The device authenticates with its write credential. Slots the profile
    /// does not name are stored as null.
    pub async fn record_telemetry(
        &self,
        writekey: &str,
        fields: Slots<FieldKind>,
    ) -> FleetResult<TelemetryEntry> {
        let device = self.device_by_writekey(writekey).await?;
        let fields = self.masked_fields(&device, fields).await?;

        let entry = TelemetryEntry {
            id: SnapshotId::generate(),
            device_id: device.device_id,
            entry_id: self.store.next_entry_id(device.device_id).await?,
            values: fields,
            created_at: Utc::now(),
        };

        self.store.insert_telemetry(&entry).await?;
        debug!(device_id = device.device_id, entry_id = entry.entry_id, "telemetry recorded");
        Ok(entry)
    }

    /// Import a batch of telemetry rows for a device.
    ///
    /// Rows may carry their own timestamps (backfill from a device's local
    /// buffer); entry IDs continue the device's sequence in row order. The
    /// batch commits atomically.
    pub async fn bulk_record_telemetry(
        &self,
        device_id: i64,
        rows: Vec<BulkTelemetryRow>,
    ) -> FleetResult<usize> {
        if self.store.get_device(device_id).await?.is_none() {
            return Err(FleetError::not_found(
                "device",
                format!("device_id {device_id}"),
            ));
        }

        let base = self.store.next_entry_id(device_id).await?;
        let entries: Vec<TelemetryEntry> = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| TelemetryEntry {
                id: SnapshotId::generate(),
                device_id,
                entry_id: base + i as i64,
                values: row.fields,
                created_at: row.created_at.unwrap_or_else(Utc::now),
            })
            .collect();

        self.store.insert_telemetry_batch(&entries).await?;
        info!(device_id, rows = entries.len(), "telemetry batch imported");
        Ok(entries.len())
    }

    /// Record a metadata snapshot submitted by a device.
    ///
    /// Same credential and masking rules as telemetry; metadata has no
    /// delivery flag.
    pub async fn record_metadata(
        &self,
        writekey: &str,
        values: Slots<MetadataKind>,
    ) -> FleetResult<MetadataSnapshot> {
        let device = self.device_by_writekey(writekey).await?;

        let values = match self.store.get_profile(&device.profile_id).await? {
            Some(profile) => values.masked_by(&profile.metadata_names),
            None => Slots::new(),
        };

        let snapshot = MetadataSnapshot {
            id: SnapshotId::generate(),
            device_id: device.device_id,
            values,
            created_at: Utc::now(),
        };

        self.store.insert_metadata_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Record a metadata snapshot on behalf of an organisation.
    ///
    /// Values are stored as sent; read paths mask them. Returns the status
    /// projection so management tooling sees the device state in the same
    /// response.
    pub async fn record_metadata_for_org(
        &self,
        org: &OrgId,
        device_id: i64,
        values: Slots<MetadataKind>,
    ) -> FleetResult<MetadataReceipt> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;
        self.require_ownership(org, &device).await?;

        let snapshot = MetadataSnapshot {
            id: SnapshotId::generate(),
            device_id,
            values,
            created_at: Utc::now(),
        };
        self.store.insert_metadata_snapshot(&snapshot).await?;

        let latest_config = self.store.latest_config(device_id).await?;
        let status = device_status(self.store.as_ref(), &device, latest_config.as_ref()).await?;

        Ok(MetadataReceipt { device_id, status })
    }

    /// Latest metadata for a device, with the status projection.
    ///
    /// Constrained to the caller's organisation; a device elsewhere reports
    /// not-found.
    pub async fn latest_metadata(&self, org: &OrgId, device_id: i64) -> FleetResult<MetadataView> {
        let device = self
            .store
            .get_device_in_org(org, device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;

        let snapshot = self.store.latest_metadata(device_id).await?;
        let latest_config = self.store.latest_config(device_id).await?;
        let status = device_status(self.store.as_ref(), &device, latest_config.as_ref()).await?;

        let metadata = match &snapshot {
            Some(s) => match self.store.get_profile(&device.profile_id).await? {
                Some(profile) => s.values.masked_by(&profile.metadata_names),
                None => Slots::new(),
            },
            None => Slots::new(),
        };

        Ok(MetadataView {
            device_id,
            status,
            metadata,
            created_at: snapshot.map(|s| s.created_at),
        })
    }

    async fn device_by_writekey(&self, writekey: &str) -> FleetResult<Device> {
        self.store
            .find_device_by_writekey(writekey)
            .await?
            .ok_or_else(|| FleetError::forbidden("invalid API key"))
    }

    async fn masked_fields(
        &self,
        device: &Device,
        fields: Slots<FieldKind>,
    ) -> FleetResult<Slots<FieldKind>> {
        Ok(match self.store.get_profile(&device.profile_id).await? {
            Some(profile) => fields.masked_by(&profile.field_names),
            None => Slots::new(),
        })
    }

    async fn require_ownership(&self, org: &OrgId, device: &Device) -> FleetResult<()> {
        let owned = self
            .store
            .get_profile(&device.profile_id)
            .await?
            .is_some_and(|p| &p.org_id == org);

        if owned {
            Ok(())
        } else {
            Err(FleetError::forbidden(
                "device does not belong to your organisation",
            ))
        }
    }
}

impl std::fmt::Debug for TelemetryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryLedger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{DeviceKey, DeviceUid, Organisation, Profile, ProfileId};

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: TelemetryLedger,
        org: Organisation,
        device: Device,
    }

    /// One org, one profile naming field1/field2 and metadata1, one device.
    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = TelemetryLedger::new(store.clone());

        let org = Organisation::new("acme");
        store.insert_org(&org).await.unwrap();

        let mut field_names = Slots::new();
        field_names.set(0, Some("temperature".to_owned()));
        field_names.set(1, Some("humidity".to_owned()));
        let mut metadata_names = Slots::new();
        metadata_names.set(0, Some("location".to_owned()));

        let profile = Profile {
            id: ProfileId::generate(),
            org_id: org.id.clone(),
            name: "soil-sensor".to_owned(),
            description: None,
            field_names,
            metadata_names,
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
            firmware_download_state: Default::default(),
            file_download_state: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_device(&device).await.unwrap();

        Fixture {
            store,
            ledger,
            org,
            device,
        }
    }

    fn fields(pairs: &[(usize, &str)]) -> Slots<FieldKind> {
        let mut slots = Slots::new();
        for (i, v) in pairs {
            slots.set(*i, Some((*v).to_owned()));
        }
        slots
    }

    #[tokio::test]
    async fn unknown_writekey_is_forbidden_and_writes_nothing() {
        let f = fixture().await;

        let result = f
            .ledger
            .record_telemetry("0000000000000000", fields(&[(0, "21.5")]))
            .await;
        assert!(matches!(result, Err(FleetError::Forbidden(_))));

        assert!(f.store.latest_telemetry(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unnamed_field_slots_are_nulled_before_storage() {
        let f = fixture().await;

        // field3 is not named by the profile.
        f.ledger
            .record_telemetry(
                f.device.writekey.as_str(),
                fields(&[(0, "21.5"), (2, "dropped")]),
            )
            .await
            .unwrap();

        let stored = f.store.latest_telemetry(1).await.unwrap().unwrap();
        assert_eq!(stored.values.get(0), Some("21.5"));
        assert_eq!(stored.values.get(2), None);
    }

    #[tokio::test]
    async fn entry_ids_increment_per_device() {
        let f = fixture().await;

        for expected in 1..=3 {
            let entry = f
                .ledger
                .record_telemetry(f.device.writekey.as_str(), fields(&[(0, "20")]))
                .await
                .unwrap();
            assert_eq!(entry.entry_id, expected);
        }
    }

    #[tokio::test]
    async fn bulk_import_continues_sequence_and_keeps_timestamps() {
        let f = fixture().await;

        f.ledger
            .record_telemetry(f.device.writekey.as_str(), fields(&[(0, "20")]))
            .await
            .unwrap();

        let backfill_time = Utc::now() - chrono::Duration::hours(6);
        let rows = vec![
            BulkTelemetryRow {
                created_at: Some(backfill_time),
                fields: fields(&[(0, "18")]),
            },
            BulkTelemetryRow {
                created_at: None,
                fields: fields(&[(0, "19")]),
            },
        ];

        let written = f.ledger.bulk_record_telemetry(1, rows).await.unwrap();
        assert_eq!(written, 2);

        let history = f.store.list_telemetry_history(1, 10).await.unwrap();
        assert_eq!(history.len(), 3);

        let ids: Vec<i64> = {
            let mut ids: Vec<i64> = history.iter().map(|e| e.entry_id).collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(ids, vec![1, 2, 3]);

        let backfilled = history.iter().find(|e| e.entry_id == 2).unwrap();
        assert_eq!(backfilled.created_at, backfill_time);
    }

    #[tokio::test]
    async fn bulk_import_for_missing_device_is_not_found() {
        let f = fixture().await;
        let result = f.ledger.bulk_record_telemetry(99, Vec::new()).await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn metadata_writekey_path_masks_unnamed_slots() {
        let f = fixture().await;

        let mut values = Slots::new();
        values.set(0, Some("greenhouse-3".to_owned()));
        values.set(1, Some("dropped".to_owned()));

        f.ledger
            .record_metadata(f.device.writekey.as_str(), values)
            .await
            .unwrap();

        let stored = f.store.latest_metadata(1).await.unwrap().unwrap();
        assert_eq!(stored.values.get(0), Some("greenhouse-3"));
        assert_eq!(stored.values.get(1), None);
    }

    #[tokio::test]
    async fn org_metadata_write_returns_status_and_stores_raw() {
        let f = fixture().await;

        let mut values = Slots::new();
        values.set(0, Some("greenhouse-3".to_owned()));
        values.set(1, Some("kept-raw".to_owned()));

        let receipt = f
            .ledger
            .record_metadata_for_org(&f.org.id, 1, values)
            .await
            .unwrap();
        assert_eq!(receipt.device_id, 1);
        assert!(!receipt.status.config_updated);

        // The org path stores values as sent; the read path masks.
        let stored = f.store.latest_metadata(1).await.unwrap().unwrap();
        assert_eq!(stored.values.get(1), Some("kept-raw"));

        let view = f.ledger.latest_metadata(&f.org.id, 1).await.unwrap();
        assert_eq!(view.metadata.get(0), Some("greenhouse-3"));
        assert_eq!(view.metadata.get(1), None);
        assert!(view.created_at.is_some());
    }

    #[tokio::test]
    async fn org_metadata_write_to_foreign_device_is_forbidden() {
        let f = fixture().await;
        let other = Organisation::new("globex");
        f.store.insert_org(&other).await.unwrap();

        let result = f
            .ledger
            .record_metadata_for_org(&other.id, 1, Slots::new())
            .await;
        assert!(matches!(result, Err(FleetError::Forbidden(_))));
    }

    #[tokio::test]
    async fn cross_tenant_metadata_read_is_not_found() {
        let f = fixture().await;
        let other = Organisation::new("globex");
        f.store.insert_org(&other).await.unwrap();

        let result = f.ledger.latest_metadata(&other.id, 1).await;
        assert!(matches!(result, Err(FleetError::NotFound { .. })));
    }

    #[tokio::test]
    async fn latest_metadata_without_history_is_empty_view() {
        let f = fixture().await;

        let view = f.ledger.latest_metadata(&f.org.id, 1).await.unwrap();
        assert!(view.metadata.is_empty());
        assert!(view.created_at.is_none());
    }
}
