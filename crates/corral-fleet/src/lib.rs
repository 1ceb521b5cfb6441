//! Corral Fleet Service
//!
//! This crate provides a multi-tenant IoT fleet-management backend:
//! organisations manage devices, firmware images, and per-device
//! configuration and telemetry.
//!
//! # Architecture
//!
//! The service is responsible for:
//!
//! - **Config convergence**: an append-only history of per-device config
//!   snapshots with a pull/ack delivery protocol — devices poll their
//!   config, acknowledge it, and stay quiet until the next write
//! - **Firmware rollout**: tracking current/previous/target firmware per
//!   device, CRC-validated artifact storage, and resumable byte-range
//!   downloads over constrained device links
//! - **Device registry**: device identity, credentials, and profile-scoped
//!   tenant isolation
//! - **Telemetry and metadata ledgers**: append-only time series of
//!   device-submitted values with per-organisation slot schemas
//!
//! # Config delivery state machine
//!
//! Each config snapshot carries a one-way delivery flag:
//!
//! ```text
//! Pending (config_updated = false) ──▶ Acknowledged (config_updated = true)
//! ```
//!
//! Only a new snapshot makes a device pending again; repeated polls after
//! acknowledgement are cheap no-ops.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use corral_fleet::{ConvergenceEngine, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = ConvergenceEngine::new(store);
//!
//! // Management writes a partial config; unspecified slots carry forward.
//! let view = engine.write_config(1, slots).await?;
//!
//! // The device pulls and acknowledges in one step.
//! let outcome = engine.poll_and_ack(&org_id, 1).await?;
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod convergence;
pub mod error;
pub mod image;
pub mod ledger;
pub mod registry;
pub mod rollout;
pub mod storage;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{FleetConfig, StorageConfig};
pub use convergence::{ConvergenceEngine, ConfigView, MassWriteOutcome, PollOutcome};
pub use error::{FleetError, FleetResult};
pub use ledger::TelemetryLedger;
pub use registry::{CreateDeviceRequest, DeviceRegistry, UpdateDeviceRequest};
pub use rollout::{
    device_status, ArtifactDownload, ByteRange, FirmwarePayload, FirmwareUpload, RangeSpec,
    RolloutEngine,
};
pub use storage::create_object_store;
pub use store::{FleetStore, MemoryStore, PostgresStore};
pub use types::{
    ArtifactKind, ConfigKind, ConfigSnapshot, Device, DeviceKey, DeviceStatus, DeviceUid,
    FieldKind, Firmware, FirmwareDownload, FirmwareDownloadState, FirmwareId, FirmwareType,
    MetadataKind, MetadataSnapshot, OrgId, Organisation, Profile, ProfileId, SlotKind, Slots,
    SnapshotId, TelemetryEntry,
};
