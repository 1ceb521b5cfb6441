//! Config convergence engine.
//!
//! Maintains, per device, an append-only sequence of config snapshots and a
//! single delivery flag per snapshot. Writes create new snapshots that carry
//! forward any slot the caller did not supply; devices pull their config and
//! acknowledge it in one step.
//!
//! Per snapshot the delivery flag is a one-way state machine:
//!
//! ```text
//! Pending (config_updated = false) ──▶ Acknowledged (config_updated = true)
//! ```
//!
//! There is no transition back: a device is only made pending again by a new
//! snapshot. Repeated polls after acknowledgement return a cheap
//! already-current response until the next write.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::rollout::device_status;
use crate::store::FleetStore;
use crate::types::{
    ConfigKind, ConfigSnapshot, Device, DeviceStatus, OrgId, Slots, SnapshotId,
};

/// A device's config as returned to callers.
///
/// The `configs` map is masked: slots the profile does not name and slots
/// with no value are omitted.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    /// Device-facing identifier.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Device-reported auxiliary file download flag.
    #[serde(rename = "fileDownloadState")]
    pub file_download_state: bool,
    /// Uniform status projection.
    pub status: DeviceStatus,
    /// Masked slot values.
    pub configs: Slots<ConfigKind>,
}

/// Outcome of a device config poll.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PollOutcome {
    /// The latest snapshot was pending; it is now acknowledged and its full
    /// slot map is delivered. The embedded status carries the pre-flip flag
    /// (`config_updated = false`) so the device can tell a fresh delivery
    /// from an already-current answer.
    Delivered(ConfigView),
    /// The latest snapshot was already acknowledged; no slot map included.
    AlreadyCurrent {
        /// Device-facing identifier.
        #[serde(rename = "deviceID")]
        device_id: i64,
        /// Uniform status projection.
        status: DeviceStatus,
        /// Human-readable note.
        message: &'static str,
    },
    /// The device has no config history yet.
    NoConfig {
        /// Device-facing identifier.
        #[serde(rename = "deviceID")]
        device_id: i64,
        /// Uniform status projection.
        status: DeviceStatus,
        /// Human-readable note.
        message: &'static str,
    },
}

/// One failed item of a mass config write.
#[derive(Debug, Clone, Serialize)]
pub struct MassWriteFailure {
    /// Device-facing identifier the failure refers to.
    #[serde(rename = "deviceID")]
    pub device_id: i64,
    /// Why this device was skipped.
    pub error: String,
}

/// Partitioned outcome of a mass config write.
#[derive(Debug, Serialize)]
pub struct MassWriteOutcome {
    /// Per-device views for the devices that were written.
    pub success: Vec<ConfigView>,
    /// Per-device failures; these do not abort the batch.
    pub failed: Vec<MassWriteFailure>,
}

/// Orchestrates config snapshot writes and the pull/ack protocol.
pub struct ConvergenceEngine {
    store: Arc<dyn FleetStore>,
}

impl ConvergenceEngine {
    /// Create a new convergence engine.
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Write a config snapshot for a device.
    ///
    /// Slots absent from `values` inherit the prior snapshot's value, so a
    /// partial write never clears slots the caller did not mention. The new
    /// snapshot starts pending: the device has, by definition, not yet
    /// fetched it.
    pub async fn write_config(
        &self,
        device_id: i64,
        values: Slots<ConfigKind>,
    ) -> FleetResult<ConfigView> {
        let device = self.require_device(device_id).await?;
        let snapshot = self.append_snapshot(&device, &values, false).await?;
        self.config_view(&device, &snapshot).await
    }

    /// Write a config snapshot on behalf of an organisation.
    ///
    /// Same merge rule as [`ConvergenceEngine::write_config`], but the
    /// snapshot is created already acknowledged: an org-authenticated push
    /// is considered already known to the caller, so the device must not be
    /// re-prompted for it.
    pub async fn write_config_preacknowledged(
        &self,
        org: &OrgId,
        device_id: i64,
        values: Slots<ConfigKind>,
    ) -> FleetResult<ConfigView> {
        let device = self.require_device(device_id).await?;
        self.require_ownership(org, &device).await?;

        let snapshot = self.append_snapshot(&device, &values, true).await?;
        self.config_view(&device, &snapshot).await
    }

    /// Apply one config write to many devices independently.
    ///
    /// Empty-string slot values are treated the same as absent ones: carry
    /// the previous value forward. A device that does not exist lands in the
    /// `failed` partition without affecting the rest; everything that was
    /// staged commits atomically in one batch.
    pub async fn mass_write_config(
        &self,
        device_ids: &[i64],
        values: &Slots<ConfigKind>,
    ) -> FleetResult<MassWriteOutcome> {
        let values = values.without_blanks();

        let mut staged: Vec<(Device, ConfigSnapshot)> = Vec::new();
        let mut failed = Vec::new();

        for &device_id in device_ids {
            let Some(device) = self.store.get_device(device_id).await? else {
                failed.push(MassWriteFailure {
                    device_id,
                    error: "device not found".to_owned(),
                });
                continue;
            };

            let previous = self.store.latest_config(device_id).await?;
            let merged = values.merged_over(&previous.map(|s| s.values).unwrap_or_default());

            let snapshot = ConfigSnapshot {
                id: SnapshotId::generate(),
                device_id,
                values: merged,
                config_updated: false,
                created_at: chrono::Utc::now(),
            };
            staged.push((device, snapshot));
        }

        let snapshots: Vec<ConfigSnapshot> =
            staged.iter().map(|(_, s)| s.clone()).collect();
        self.store.insert_config_snapshots(&snapshots).await?;

        info!(
            written = staged.len(),
            failed = failed.len(),
            "mass config write committed"
        );

        let mut success = Vec::with_capacity(staged.len());
        for (device, snapshot) in &staged {
            success.push(self.config_view(device, snapshot).await?);
        }

        Ok(MassWriteOutcome { success, failed })
    }

    /// Read a device's current config without touching the delivery flag.
    pub async fn read_latest_config(&self, device_id: i64) -> FleetResult<ConfigView> {
        let device = self.require_device(device_id).await?;
        let snapshot = self
            .store
            .latest_config(device_id)
            .await?
            .ok_or_else(|| {
                FleetError::not_found("config snapshot", format!("no config for device {device_id}"))
            })?;

        self.config_view(&device, &snapshot).await
    }

    /// The device pull path: read the latest snapshot and acknowledge it.
    ///
    /// A pending snapshot is flipped to acknowledged (persisted) and
    /// delivered with its full masked slot map; the reported status still
    /// carries `config_updated = false` from before the flip. An already
    /// acknowledged snapshot yields the cheap already-current answer.
    /// Idempotent from the second call onwards.
    pub async fn poll_and_ack(&self, org: &OrgId, device_id: i64) -> FleetResult<PollOutcome> {
        let device = self
            .store
            .get_device_in_org(org, device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))?;

        let Some(snapshot) = self.store.latest_config(device_id).await? else {
            let status = device_status(self.store.as_ref(), &device, None).await?;
            return Ok(PollOutcome::NoConfig {
                device_id,
                status,
                message: "no configuration found for this device",
            });
        };

        if snapshot.config_updated {
            debug!(device_id, snapshot = %snapshot.id, "config already acknowledged");
            let status = device_status(self.store.as_ref(), &device, Some(&snapshot)).await?;
            return Ok(PollOutcome::AlreadyCurrent {
                device_id,
                status,
                message: "configuration is up to date",
            });
        }

        self.store.acknowledge_config(&snapshot.id).await?;
        info!(device_id, snapshot = %snapshot.id, "config delivered and acknowledged");

        // The view is built from the pre-flip snapshot on purpose: the
        // device learns it is receiving a fresh config.
        self.config_view(&device, &snapshot).await.map(PollOutcome::Delivered)
    }

    async fn require_device(&self, device_id: i64) -> FleetResult<Device> {
        self.store
            .get_device(device_id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", format!("device_id {device_id}")))
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

    /// Merge `values` over the device's latest snapshot and append the result.
    async fn append_snapshot(
        &self,
        device: &Device,
        values: &Slots<ConfigKind>,
        acknowledged: bool,
    ) -> FleetResult<ConfigSnapshot> {
        let previous = self.store.latest_config(device.device_id).await?;
        let merged = values.merged_over(&previous.map(|s| s.values).unwrap_or_default());

        let snapshot = ConfigSnapshot {
            id: SnapshotId::generate(),
            device_id: device.device_id,
            values: merged,
            config_updated: acknowledged,
            created_at: chrono::Utc::now(),
        };

        self.store.insert_config_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Project a snapshot into the wire view, masking inert and empty slots.
    async fn config_view(
        &self,
        device: &Device,
        snapshot: &ConfigSnapshot,
    ) -> FleetResult<ConfigView> {
        let status = device_status(self.store.as_ref(), device, Some(snapshot)).await?;

        let configs = match self.store.get_profile(&device.profile_id).await? {
            Some(profile) => snapshot.values.masked_by(&profile.config_names),
            None => Slots::new(),
        };

        Ok(ConfigView {
            device_id: device.device_id,
            file_download_state: device.file_download_state,
            status,
            configs,
        })
    }
}

impl std::fmt::Debug for ConvergenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceEngine").finish_non_exhaustive()
    }
}
