//! Fleet storage backends.
//!
//! This module provides the trait and implementations for persisting fleet
//! state. The primary implementation uses PostgreSQL, but an in-memory
//! implementation is provided for testing.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::FleetResult;
use crate::types::{
    ConfigSnapshot, Device, Firmware, FirmwareId, FirmwareType, MetadataSnapshot, OrgId,
    Organisation, Profile, ProfileId, SnapshotId, TelemetryEntry,
};

/// Backend for storing fleet state.
///
/// Implementations must make every mutation atomic and durable: each config
/// or firmware change is a single insert or a single-row update, and the
/// batch insert commits all rows or none. Concurrent acknowledgement flips
/// against the same snapshot may race at the storage layer; the flip is
/// idempotent, so last-commit-wins is acceptable.
#[async_trait]
pub trait FleetStore: Send + Sync {
    // -- organisations ------------------------------------------------------

    /// Insert a new organisation.
    ///
    /// Returns a conflict error if the ID or capability token already exists.
    async fn insert_org(&self, org: &Organisation) -> FleetResult<()>;

    /// Get an organisation by ID. Returns `None` if absent.
    async fn get_org(&self, id: &OrgId) -> FleetResult<Option<Organisation>>;

    /// Resolve an organisation from its opaque capability token.
    async fn find_org_by_token(&self, token: &str) -> FleetResult<Option<Organisation>>;

    // -- profiles -----------------------------------------------------------

    /// Insert a new profile.
    ///
    /// Returns a conflict error if the organisation already has a profile
    /// with the same name.
    async fn insert_profile(&self, profile: &Profile) -> FleetResult<()>;

    /// Get a profile by ID. Returns `None` if absent.
    async fn get_profile(&self, id: &ProfileId) -> FleetResult<Option<Profile>>;

    /// List an organisation's profiles, newest first.
    async fn list_profiles(&self, org: &OrgId) -> FleetResult<Vec<Profile>>;

    // -- devices ------------------------------------------------------------

    /// Insert a new device.
    ///
    /// Returns a conflict error if the name, sequential ID, or either
    /// credential is already taken.
    async fn insert_device(&self, device: &Device) -> FleetResult<()>;

    /// Get a device by its sequential device ID, regardless of tenant.
    async fn get_device(&self, device_id: i64) -> FleetResult<Option<Device>>;

    /// Get a device by sequential ID, constrained to an organisation via its
    /// profile. Returns `None` both when the device does not exist and when
    /// it belongs to another organisation.
    async fn get_device_in_org(&self, org: &OrgId, device_id: i64) -> FleetResult<Option<Device>>;

    /// Find a device by name.
    async fn find_device_by_name(&self, name: &str) -> FleetResult<Option<Device>>;

    /// Find a device by its write credential.
    async fn find_device_by_writekey(&self, writekey: &str) -> FleetResult<Option<Device>>;

    /// Next sequential device ID: max existing + 1, or 1 when the registry
    /// is empty. The unique constraint on `device_id` catches the race
    /// between concurrent creations.
    async fn next_device_id(&self) -> FleetResult<i64>;

    /// Replace a device row (matched by its internal UID).
    async fn update_device(&self, device: &Device) -> FleetResult<()>;

    /// List an organisation's devices, ordered by sequential ID.
    async fn list_devices(&self, org: &OrgId) -> FleetResult<Vec<Device>>;

    // -- firmware -----------------------------------------------------------

    /// Insert a new firmware record.
    ///
    /// Returns a conflict error if the organisation already has this version.
    async fn insert_firmware(&self, firmware: &Firmware) -> FleetResult<()>;

    /// Get a firmware by ID within an organisation.
    async fn get_firmware(&self, org: &OrgId, id: &FirmwareId) -> FleetResult<Option<Firmware>>;

    /// Get a firmware by ID alone.
    ///
    /// Used by the status projection, where the target pointer was already
    /// validated against the device's organisation at assignment time.
    async fn get_firmware_by_id(&self, id: &FirmwareId) -> FleetResult<Option<Firmware>>;

    /// Find a firmware by version string within an organisation.
    async fn find_firmware_by_version(
        &self,
        org: &OrgId,
        version: &str,
    ) -> FleetResult<Option<Firmware>>;

    /// List an organisation's firmware images, newest first.
    async fn list_firmware(&self, org: &OrgId) -> FleetResult<Vec<Firmware>>;

    /// Change a firmware's release channel. The only mutable firmware field.
    async fn set_firmware_type(
        &self,
        org: &OrgId,
        id: &FirmwareId,
        firmware_type: FirmwareType,
    ) -> FleetResult<()>;

    // -- config history -----------------------------------------------------

    /// Append one config snapshot.
    async fn insert_config_snapshot(&self, snapshot: &ConfigSnapshot) -> FleetResult<()>;

    /// Append a batch of config snapshots atomically (all rows or none).
    async fn insert_config_snapshots(&self, snapshots: &[ConfigSnapshot]) -> FleetResult<()>;

    /// Most recent config snapshot for a device, by creation time.
    async fn latest_config(&self, device_id: i64) -> FleetResult<Option<ConfigSnapshot>>;

    /// Flip a snapshot's delivery flag to acknowledged.
    ///
    /// Idempotent: re-acknowledging an acknowledged snapshot is a no-op.
    async fn acknowledge_config(&self, id: &SnapshotId) -> FleetResult<()>;

    /// Recent config history for a device, newest first.
    async fn list_config_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<ConfigSnapshot>>;

    // -- metadata history ---------------------------------------------------

    /// Append one metadata snapshot.
    async fn insert_metadata_snapshot(&self, snapshot: &MetadataSnapshot) -> FleetResult<()>;

    /// Most recent metadata snapshot for a device.
    async fn latest_metadata(&self, device_id: i64) -> FleetResult<Option<MetadataSnapshot>>;

    /// Recent metadata history for a device, newest first.
    async fn list_metadata_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<MetadataSnapshot>>;

    // -- telemetry ----------------------------------------------------------

    /// Append one telemetry entry.
    async fn insert_telemetry(&self, entry: &TelemetryEntry) -> FleetResult<()>;

    /// Append a batch of telemetry entries atomically.
    async fn insert_telemetry_batch(&self, entries: &[TelemetryEntry]) -> FleetResult<()>;

    /// Next per-device entry sequence number: max existing + 1, or 1.
    async fn next_entry_id(&self, device_id: i64) -> FleetResult<i64>;

    /// Most recent telemetry entry for a device.
    async fn latest_telemetry(&self, device_id: i64) -> FleetResult<Option<TelemetryEntry>>;

    /// Recent telemetry history for a device, newest first.
    async fn list_telemetry_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<TelemetryEntry>>;
}
