//! Shared fixtures for integration tests.

use std::sync::Arc;

use corral_fleet::api::AppState;
use corral_fleet::registry::{CreateDeviceRequest, CreateProfileRequest};
use corral_fleet::{
    create_object_store, ConvergenceEngine, Device, DeviceRegistry, FleetStore, MemoryStore,
    Organisation, Profile, RolloutEngine, StorageConfig, TelemetryLedger,
};
use corral_fleet::{ConfigKind, FieldKind, MetadataKind, Slots};

/// A fleet service wired over in-memory stores.
pub struct TestFleet {
    pub store: Arc<MemoryStore>,
    pub state: AppState,
}

impl TestFleet {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let fleet_store: Arc<dyn FleetStore> = store.clone();
        let blobs = create_object_store(&StorageConfig::Memory).expect("memory store");

        let state = AppState {
            store: Arc::clone(&fleet_store),
            convergence: Arc::new(ConvergenceEngine::new(Arc::clone(&fleet_store))),
            rollout: Arc::new(RolloutEngine::new(Arc::clone(&fleet_store), blobs)),
            registry: Arc::new(DeviceRegistry::new(Arc::clone(&fleet_store))),
            ledger: Arc::new(TelemetryLedger::new(fleet_store)),
        };

        Self { store, state }
    }

    /// Create an organisation.
    pub async fn org(&self, name: &str) -> Organisation {
        self.state
            .registry
            .create_organisation(name)
            .await
            .expect("create organisation")
    }

    /// Create a profile naming `config1`/`config3`, `field1`/`field2`, and
    /// `metadata1`.
    pub async fn profile(&self, org: &Organisation, name: &str) -> Profile {
        let mut config_names = Slots::<ConfigKind>::new();
        config_names.set(0, Some("interval".to_owned()));
        config_names.set(2, Some("threshold".to_owned()));

        let mut field_names = Slots::<FieldKind>::new();
        field_names.set(0, Some("temperature".to_owned()));
        field_names.set(1, Some("humidity".to_owned()));

        let mut metadata_names = Slots::<MetadataKind>::new();
        metadata_names.set(0, Some("location".to_owned()));

        self.state
            .registry
            .create_profile(
                &org.id,
                CreateProfileRequest {
                    name: name.to_owned(),
                    description: None,
                    field_names,
                    metadata_names,
                    config_names,
                },
            )
            .await
            .expect("create profile")
    }

    /// Register a device under a profile.
    pub async fn device(&self, org: &Organisation, profile: &Profile, name: &str) -> Device {
        self.state
            .registry
            .create_device(
                &org.id,
                CreateDeviceRequest {
                    name: name.to_owned(),
                    profile_id: profile.id.clone(),
                    current_firmware: None,
                    previous_firmware: None,
                    target_firmware: None,
                    firmware_download_state: None,
                    file_download_state: None,
                },
            )
            .await
            .expect("create device")
    }
}

/// Build a sparse config slot map from `(slot, value)` pairs.
pub fn config_slots(pairs: &[(usize, &str)]) -> Slots<ConfigKind> {
    let mut slots = Slots::new();
    for (i, v) in pairs {
        slots.set(*i, Some((*v).to_owned()));
    }
    slots
}
