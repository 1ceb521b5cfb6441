//! Core types for corral-fleet.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier for an organisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    /// Create an organisation ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique organisation ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for OrgId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a device profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a profile ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique profile ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProfileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Internal row identifier for a device.
///
/// Distinct from [`Device::device_id`], the small sequential integer that
/// devices use to identify themselves on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceUid(String);

impl DeviceUid {
    /// Create a device UID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique device UID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the UID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeviceUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirmwareId(String);

impl FirmwareId {
    /// Create a firmware ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique firmware ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FirmwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FirmwareId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a history row (config/metadata snapshot, telemetry entry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Create a snapshot ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique snapshot ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SnapshotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Length of generated device credentials.
const DEVICE_KEY_LEN: usize = 16;

/// A device credential (readkey or writekey).
///
/// Generated as a 16-character random alphanumeric string. Uniqueness is
/// enforced by the store, not by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Wrap an existing credential string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh random credential.
    #[must_use]
    pub fn generate() -> Self {
        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(DEVICE_KEY_LEN)
            .map(char::from)
            .collect();
        Self(key)
    }

    /// Get the credential as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeviceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Slot arrays
// =============================================================================

/// Marker trait for a family of numbered slots.
///
/// A profile assigns a real-world name to each slot position; a slot without
/// a name is inert and must never appear in device-facing output. The three
/// kinds differ only in wire prefix and count, so the slot container is
/// generic over a zero-sized marker, the same way deployment states are
/// modelled as phantom markers elsewhere in the codebase family.
pub trait SlotKind: private::Sealed + Send + Sync + 'static {
    /// Wire key prefix (`config`, `field`, `metadata`).
    const PREFIX: &'static str;
    /// Number of slots of this kind.
    const COUNT: usize;
}

mod private {
    pub trait Sealed {}
}

/// Config slots: `config1` .. `config10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigKind;

/// Telemetry field slots: `field1` .. `field15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKind;

/// Metadata slots: `metadata1` .. `metadata15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataKind;

impl private::Sealed for ConfigKind {}
impl private::Sealed for FieldKind {}
impl private::Sealed for MetadataKind {}

impl SlotKind for ConfigKind {
    const PREFIX: &'static str = "config";
    const COUNT: usize = 10;
}

impl SlotKind for FieldKind {
    const PREFIX: &'static str = "field";
    const COUNT: usize = 15;
}

impl SlotKind for MetadataKind {
    const PREFIX: &'static str = "metadata";
    const COUNT: usize = 15;
}

/// A fixed-size ordered array of optional slot values.
///
/// Serialises as a sparse map (`{"config1": "a", "config3": "c"}`); absent
/// and null slots are omitted. Slot indices are zero-based in code and
/// one-based on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slots<K: SlotKind> {
    values: Vec<Option<String>>,
    _kind: PhantomData<K>,
}

impl<K: SlotKind> Slots<K> {
    /// Create an empty slot array (all positions unset).
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: vec![None; K::COUNT],
            _kind: PhantomData,
        }
    }

    /// Number of slots of this kind.
    #[must_use]
    pub const fn len() -> usize {
        K::COUNT
    }

    /// Wire key for a zero-based slot index (`config1` for slot 0).
    #[must_use]
    pub fn slot_key(slot: usize) -> String {
        format!("{}{}", K::PREFIX, slot + 1)
    }

    /// Get the value at a zero-based slot index.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&str> {
        self.values.get(slot).and_then(|v| v.as_deref())
    }

    /// Set the value at a zero-based slot index.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= K::COUNT`.
    pub fn set(&mut self, slot: usize, value: Option<String>) {
        self.values[slot] = value;
    }

    /// Whether every slot is unset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Iterate over `(slot, value)` pairs for set slots.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &str)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_deref().map(|v| (i, v)))
    }

    /// Merge this array over a previous one: each slot keeps the incoming
    /// value when set, otherwise inherits the previous value.
    ///
    /// This is the carry-forward rule that keeps partial writes from
    /// silently clearing slots the caller did not mention.
    #[must_use]
    pub fn merged_over(&self, previous: &Self) -> Self {
        let values = self
            .values
            .iter()
            .zip(&previous.values)
            .map(|(incoming, prior)| incoming.clone().or_else(|| prior.clone()))
            .collect();
        Self {
            values,
            _kind: PhantomData,
        }
    }

    /// Copy with empty-string values treated as unset.
    ///
    /// The mass-edit path uses `""` as an explicit "no change" sentinel;
    /// normalising it to `None` lets the regular merge rule apply.
    #[must_use]
    pub fn without_blanks(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|v| v.clone().filter(|s| !s.is_empty()))
            .collect();
        Self {
            values,
            _kind: PhantomData,
        }
    }

    /// Copy with every slot cleared whose name in `names` is absent or blank.
    ///
    /// Used by read-facing projections so inert slots never reach a client,
    /// and by write paths that discard values for unnamed slots outright.
    #[must_use]
    pub fn masked_by(&self, names: &Self) -> Self {
        let values = self
            .values
            .iter()
            .zip(&names.values)
            .map(|(value, name)| match name.as_deref() {
                Some(n) if !n.trim().is_empty() => value.clone(),
                _ => None,
            })
            .collect();
        Self {
            values,
            _kind: PhantomData,
        }
    }
}

impl<K: SlotKind> Default for Slots<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SlotKind> Serialize for Slots<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (slot, value) in self.entries() {
            map.serialize_entry(&Self::slot_key(slot), value)?;
        }
        map.end()
    }
}

impl<'de, K: SlotKind> Deserialize<'de> for Slots<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SlotsVisitor<K>(PhantomData<K>);

        impl<'de, K: SlotKind> Visitor<'de> for SlotsVisitor<K> {
            type Value = Slots<K>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a map of {}1..{}{} entries", K::PREFIX, K::PREFIX, K::COUNT)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut slots = Slots::<K>::new();
                while let Some(key) = access.next_key::<String>()? {
                    match parse_slot_key::<K>(&key) {
                        Some(slot) => slots.values[slot] = access.next_value()?,
                        // Unknown keys are ignored, matching the lenient
                        // behaviour expected of device-submitted payloads.
                        None => {
                            let _ = access.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(slots)
            }
        }

        deserializer.deserialize_map(SlotsVisitor(PhantomData))
    }
}

/// Parse a wire key (`config3`) into a zero-based slot index.
fn parse_slot_key<K: SlotKind>(key: &str) -> Option<usize> {
    let index: usize = key.strip_prefix(K::PREFIX)?.parse().ok()?;
    (1..=K::COUNT).contains(&index).then(|| index - 1)
}

// =============================================================================
// Enumerations
// =============================================================================

/// Firmware rollout state of a device.
///
/// `updated` means the device's current firmware matches the target;
/// `pending` means a differing target has been assigned and the device has
/// not yet reported a successful download; `failed` is reported by the
/// device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareDownloadState {
    /// Current firmware matches the target.
    Updated,
    /// A differing target firmware has been assigned.
    Pending,
    /// The device reported a failed download.
    Failed,
}

impl FirmwareDownloadState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl Default for FirmwareDownloadState {
    fn default() -> Self {
        Self::Updated
    }
}

impl fmt::Display for FirmwareDownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FirmwareDownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updated" => Ok(Self::Updated),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown firmware download state: {s}")),
        }
    }
}

/// Release channel of a firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareType {
    /// Production release.
    Stable,
    /// Pre-release build.
    Beta,
    /// No longer recommended; kept for rollback.
    Deprecated,
    /// Historic build retained for old hardware revisions.
    Legacy,
}

impl FirmwareType {
    /// Get the type name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Deprecated => "deprecated",
            Self::Legacy => "legacy",
        }
    }
}

impl Default for FirmwareType {
    fn default() -> Self {
        Self::Beta
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FirmwareType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "deprecated" => Ok(Self::Deprecated),
            "legacy" => Ok(Self::Legacy),
            _ => Err(format!("unknown firmware type: {s}")),
        }
    }
}

/// Kind of stored firmware artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw binary image flashed by devices.
    Bin,
    /// Original Intel HEX source, for programmer tooling.
    Hex,
    /// Bootloader image, stored verbatim.
    Bootloader,
}

impl ArtifactKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bin => "bin",
            Self::Hex => "hex",
            Self::Bootloader => "bootloader",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bin" => Ok(Self::Bin),
            "hex" => Ok(Self::Hex),
            "bootloader" => Ok(Self::Bootloader),
            _ => Err(format!("unknown artifact kind: {s}")),
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// A tenant. Owns profiles and firmware images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organisation {
    /// Unique organisation identifier.
    pub id: OrgId,
    /// Display name.
    pub name: String,
    /// Opaque capability token for org-scoped, non-user-authenticated calls.
    pub token: String,
    /// When the organisation was created.
    pub created_at: DateTime<Utc>,
}

impl Organisation {
    /// Create a new organisation with a generated ID and capability token.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: OrgId::generate(),
            name: name.into(),
            token: ulid::Ulid::new().to_string().to_lowercase(),
            created_at: Utc::now(),
        }
    }
}

/// Per-organisation schema naming the active slots for a family of devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique profile identifier.
    pub id: ProfileId,
    /// Owning organisation.
    pub org_id: OrgId,
    /// Profile name, unique within the organisation.
    pub name: String,
    /// Optional free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Names for the 15 telemetry field slots.
    #[serde(default)]
    pub field_names: Slots<FieldKind>,
    /// Names for the 15 metadata slots.
    #[serde(default)]
    pub metadata_names: Slots<MetadataKind>,
    /// Names for the 10 config slots.
    #[serde(default)]
    pub config_names: Slots<ConfigKind>,
    /// When the profile was created.
    pub created_at: DateTime<Utc>,
}

/// A registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Internal row identifier.
    pub uid: DeviceUid,
    /// Device-facing sequential identifier, unique fleet-wide.
    pub device_id: i64,
    /// Device name, unique fleet-wide.
    pub name: String,
    /// Credential for read-only device calls.
    pub readkey: DeviceKey,
    /// Credential for device data submission.
    pub writekey: DeviceKey,
    /// Profile this device belongs to (and, transitively, its organisation).
    pub profile_id: ProfileId,
    /// Firmware currently running on the device.
    pub current_firmware: Option<FirmwareId>,
    /// Firmware the device ran before the current one.
    pub previous_firmware: Option<FirmwareId>,
    /// Firmware the device should converge to.
    pub target_firmware: Option<FirmwareId>,
    /// Rollout state for the target firmware.
    pub firmware_download_state: FirmwareDownloadState,
    /// Device-reported auxiliary file download flag.
    pub file_download_state: bool,
    /// When the device was created.
    pub created_at: DateTime<Utc>,
    /// When the device row was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A firmware image in an organisation's catalog.
///
/// Immutable after upload except [`Firmware::firmware_type`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firmware {
    /// Unique firmware identifier.
    pub id: FirmwareId,
    /// Owning organisation.
    pub org_id: OrgId,
    /// Version string, unique within the organisation.
    pub version: String,
    /// Release channel.
    pub firmware_type: FirmwareType,
    /// Optional release description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// CRC32 (IEEE) of the binary image, 8 lowercase hex digits.
    pub crc32: String,
    /// Size of the binary image in bytes.
    pub size: i64,
    /// Blob path of the binary image. Always present.
    pub bin_path: String,
    /// Blob path of the original HEX source, when the upload was HEX.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex_path: Option<String>,
    /// Blob path of the bootloader image, when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootloader_path: Option<String>,
    /// When the firmware was uploaded.
    pub created_at: DateTime<Utc>,
}

impl Firmware {
    /// Resolve the blob path for an artifact kind, if that artifact exists.
    #[must_use]
    pub fn artifact_path(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Bin => Some(&self.bin_path),
            ArtifactKind::Hex => self.hex_path.as_deref(),
            ArtifactKind::Bootloader => self.bootloader_path.as_deref(),
        }
    }
}

/// One append-only config history row.
///
/// A new row is written for every config change; the most recent row by
/// creation time is the device's current config. `config_updated` starts
/// `false` (pending) and flips to `true` exactly once, when the device
/// fetches the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Unique row identifier.
    pub id: SnapshotId,
    /// Device this snapshot belongs to.
    pub device_id: i64,
    /// The full slot state at this point in time.
    pub values: Slots<ConfigKind>,
    /// Whether the device has fetched this snapshot.
    pub config_updated: bool,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// One append-only metadata history row. Same shape as a config snapshot
/// but with no delivery flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Unique row identifier.
    pub id: SnapshotId,
    /// Device this snapshot belongs to.
    pub device_id: i64,
    /// The full slot state at this point in time.
    pub values: Slots<MetadataKind>,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// One append-only telemetry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEntry {
    /// Unique row identifier.
    pub id: SnapshotId,
    /// Device this entry belongs to.
    pub device_id: i64,
    /// Per-device sequence number, starting at 1.
    pub entry_id: i64,
    /// Submitted field values.
    pub values: Slots<FieldKind>,
    /// When the entry was recorded (may be caller-supplied in bulk imports).
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Status projection
// =============================================================================

/// Version string reported when no target firmware is resolvable.
pub const UNKNOWN_VERSION: &str = "unknown";

/// CRC string reported when no target firmware is resolvable.
pub const DEFAULT_CRC: &str = "0x00000000";

/// Firmware download descriptor nested inside [`DeviceStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareDownload {
    /// Rollout state of the device.
    #[serde(rename = "firmwareDownloadState")]
    pub state: FirmwareDownloadState,
    /// Target firmware version string, or `"unknown"`.
    pub version: String,
    /// CRC32 of the target binary, or `"0x00000000"`.
    pub fwcrc: String,
    /// Size of the target binary in bytes, or 0.
    #[serde(rename = "firmware_size")]
    pub size: i64,
}

/// The uniform device status projection.
///
/// Every endpoint that reports device status must produce exactly this
/// shape so client polling logic stays simple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the device has fetched the latest config snapshot
    /// (`false` when no snapshot exists).
    pub config_updated: bool,
    /// Device-reported auxiliary file download flag.
    #[serde(rename = "fileDownloadState")]
    pub file_download_state: bool,
    /// Target firmware descriptor.
    #[serde(rename = "firmwareDownload")]
    pub firmware_download: FirmwareDownload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keys_are_one_based() {
        assert_eq!(Slots::<ConfigKind>::slot_key(0), "config1");
        assert_eq!(Slots::<ConfigKind>::slot_key(9), "config10");
        assert_eq!(Slots::<FieldKind>::slot_key(14), "field15");
    }

    #[test]
    fn slots_serialize_sparse() {
        let mut slots = Slots::<ConfigKind>::new();
        slots.set(0, Some("a".to_owned()));
        slots.set(2, Some("c".to_owned()));

        let json = serde_json::to_value(&slots).unwrap();
        assert_eq!(json, serde_json::json!({"config1": "a", "config3": "c"}));
    }

    #[test]
    fn slots_deserialize_sparse() {
        let slots: Slots<ConfigKind> =
            serde_json::from_value(serde_json::json!({"config2": "b", "config10": "j"})).unwrap();

        assert_eq!(slots.get(1), Some("b"));
        assert_eq!(slots.get(9), Some("j"));
        assert_eq!(slots.get(0), None);
    }

    #[test]
    fn slots_deserialize_ignores_unknown_and_null() {
        let slots: Slots<ConfigKind> = serde_json::from_value(serde_json::json!({
            "config1": "a",
            "config2": null,
            "config11": "out of range",
            "unrelated": 42
        }))
        .unwrap();

        assert_eq!(slots.get(0), Some("a"));
        assert_eq!(slots.get(1), None);
    }

    #[test]
    fn merged_over_carries_forward() {
        let mut previous = Slots::<ConfigKind>::new();
        previous.set(0, Some("old-a".to_owned()));
        previous.set(1, Some("old-b".to_owned()));

        let mut incoming = Slots::<ConfigKind>::new();
        incoming.set(0, Some("new-a".to_owned()));

        let merged = incoming.merged_over(&previous);
        assert_eq!(merged.get(0), Some("new-a"));
        assert_eq!(merged.get(1), Some("old-b"));
        assert_eq!(merged.get(2), None);
    }

    #[test]
    fn without_blanks_drops_empty_strings() {
        let mut slots = Slots::<ConfigKind>::new();
        slots.set(0, Some(String::new()));
        slots.set(1, Some("kept".to_owned()));

        let cleaned = slots.without_blanks();
        assert_eq!(cleaned.get(0), None);
        assert_eq!(cleaned.get(1), Some("kept"));
    }

    #[test]
    fn masked_by_suppresses_unnamed_slots() {
        let mut names = Slots::<ConfigKind>::new();
        names.set(0, Some("interval".to_owned()));
        names.set(2, Some("threshold".to_owned()));

        let mut values = Slots::<ConfigKind>::new();
        values.set(0, Some("a".to_owned()));
        values.set(1, Some("b".to_owned()));
        values.set(2, Some("c".to_owned()));

        let masked = values.masked_by(&names);
        assert_eq!(masked.get(0), Some("a"));
        assert_eq!(masked.get(1), None);
        assert_eq!(masked.get(2), Some("c"));
    }

    #[test]
    fn device_key_is_sixteen_alphanumeric_chars() {
        let key = DeviceKey::generate();
        assert_eq!(key.as_str().len(), 16);
        assert!(key.as_str().chars().all(|c| c.is_ascii_alphanumeric()));

        // Two generations should practically never collide.
        assert_ne!(DeviceKey::generate(), DeviceKey::generate());
    }

    #[test]
    fn firmware_download_state_roundtrip() {
        for state in [
            FirmwareDownloadState::Updated,
            FirmwareDownloadState::Pending,
            FirmwareDownloadState::Failed,
        ] {
            let parsed: FirmwareDownloadState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("unknown".parse::<FirmwareDownloadState>().is_err());
    }

    #[test]
    fn status_wire_shape() {
        let status = DeviceStatus {
            config_updated: false,
            file_download_state: true,
            firmware_download: FirmwareDownload {
                state: FirmwareDownloadState::Pending,
                version: "1.2.0".to_owned(),
                fwcrc: "89abcdef".to_owned(),
                size: 4096,
            },
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "config_updated": false,
                "fileDownloadState": true,
                "firmwareDownload": {
                    "firmwareDownloadState": "pending",
                    "version": "1.2.0",
                    "fwcrc": "89abcdef",
                    "firmware_size": 4096
                }
            })
        );
    }
}
