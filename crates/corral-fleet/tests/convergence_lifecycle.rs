//! End-to-end scenarios across the registry, convergence, and rollout
//! engines.

mod common;

use common::{config_slots, TestFleet};
use corral_fleet::registry::UpdateDeviceRequest;
use corral_fleet::rollout::{FirmwarePayload, FirmwareUpload, RangeSpec};
use corral_fleet::{
    ArtifactKind, FirmwareDownloadState, FirmwareType, FleetStore, PollOutcome,
};
use bytes::Bytes;

fn upload(version: &str, payload: &[u8]) -> FirmwareUpload {
    FirmwareUpload {
        version: version.to_owned(),
        firmware_type: FirmwareType::Beta,
        description: None,
        payload: FirmwarePayload::Raw(Bytes::copy_from_slice(payload)),
        bootloader: None,
    }
}

#[tokio::test]
async fn firmware_rollout_converges_end_to_end() {
    let fleet = TestFleet::new();
    let org = fleet.org("acme").await;
    let profile = fleet.profile(&org, "soil-sensor").await;
    let device = fleet.device(&org, &profile, "dev-1").await;

    let payload = b"firmware image bytes for the rollout test";
    let firmware = fleet
        .state
        .rollout
        .upload_firmware(&org.id, upload("1.1.0", payload))
        .await
        .unwrap();

    // Steer the device to the new firmware: it has nothing installed, so
    // the rollout is pending.
    let steered = fleet
        .state
        .rollout
        .assign_target(&org.id, device.device_id, &firmware.id, "1.1.0")
        .await
        .unwrap();
    assert_eq!(
        steered.firmware_download_state,
        FirmwareDownloadState::Pending
    );

    // The device polls its config; the status carries the target firmware
    // descriptor it needs for the download.
    let outcome = fleet
        .state
        .convergence
        .poll_and_ack(&org.id, device.device_id)
        .await
        .unwrap();
    let status = match outcome {
        PollOutcome::NoConfig { status, .. } => status,
        other => panic!("expected NoConfig before any write, got {other:?}"),
    };
    assert_eq!(status.firmware_download.version, "1.1.0");
    assert_eq!(status.firmware_download.fwcrc, firmware.crc32);
    assert_eq!(status.firmware_download.size, payload.len() as i64);

    // The device downloads the image in chunks and verifies the CRC.
    let mut image = Vec::new();
    let chunk = 16u64;
    let mut offset = 0u64;
    while offset < payload.len() as u64 {
        let end = (offset + chunk - 1).min(payload.len() as u64 - 1);
        let part = fleet
            .state
            .rollout
            .download_artifact(
                &org.id,
                &firmware.id,
                ArtifactKind::Bin,
                Some(RangeSpec {
                    start: Some(offset),
                    end: Some(end),
                }),
            )
            .await
            .unwrap();
        image.extend_from_slice(&part.bytes);
        offset = end + 1;
    }
    assert_eq!(image, payload);
    assert_eq!(format!("{:08x}", crc32fast::hash(&image)), firmware.crc32);

    // The device reports the flash result.
    fleet
        .state
        .registry
        .update_device(
            &org.id,
            device.device_id,
            UpdateDeviceRequest {
                current_firmware: Some(firmware.id.clone()),
                firmware_download_state: Some(FirmwareDownloadState::Updated),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Re-assigning the now-current firmware is immediately `updated`.
    let converged = fleet
        .state
        .rollout
        .assign_target(&org.id, device.device_id, &firmware.id, "1.1.0")
        .await
        .unwrap();
    assert_eq!(
        converged.firmware_download_state,
        FirmwareDownloadState::Updated
    );
}

#[tokio::test]
async fn config_pull_ack_cycle() {
    let fleet = TestFleet::new();
    let org = fleet.org("acme").await;
    let profile = fleet.profile(&org, "soil-sensor").await;
    let device = fleet.device(&org, &profile, "dev-1").await;

    fleet
        .state
        .convergence
        .write_config(device.device_id, config_slots(&[(0, "600"), (2, "0.75")]))
        .await
        .unwrap();

    // First poll delivers the slot map with the pre-flip flag.
    match fleet
        .state
        .convergence
        .poll_and_ack(&org.id, device.device_id)
        .await
        .unwrap()
    {
        PollOutcome::Delivered(view) => {
            assert!(!view.status.config_updated);
            assert_eq!(view.configs.get(0), Some("600"));
            assert_eq!(view.configs.get(2), Some("0.75"));
        }
        other => panic!("expected Delivered, got {other:?}"),
    }

    // Subsequent polls are cheap and carry no map.
    for _ in 0..2 {
        match fleet
            .state
            .convergence
            .poll_and_ack(&org.id, device.device_id)
            .await
            .unwrap()
        {
            PollOutcome::AlreadyCurrent { status, .. } => assert!(status.config_updated),
            other => panic!("expected AlreadyCurrent, got {other:?}"),
        }
    }

    // A partial management write re-arms the cycle and carries slot 2
    // forward.
    fleet
        .state
        .convergence
        .write_config(device.device_id, config_slots(&[(0, "300")]))
        .await
        .unwrap();

    match fleet
        .state
        .convergence
        .poll_and_ack(&org.id, device.device_id)
        .await
        .unwrap()
    {
        PollOutcome::Delivered(view) => {
            assert_eq!(view.configs.get(0), Some("300"));
            assert_eq!(view.configs.get(2), Some("0.75"));
        }
        other => panic!("expected Delivered, got {other:?}"),
    }
}

#[tokio::test]
async fn mass_write_touches_every_existing_device() {
    let fleet = TestFleet::new();
    let org = fleet.org("acme").await;
    let profile = fleet.profile(&org, "soil-sensor").await;

    let mut ids = Vec::new();
    for name in ["a", "b", "c", "d"] {
        ids.push(fleet.device(&org, &profile, name).await.device_id);
    }
    ids.insert(2, 9999); // one device that does not exist

    let outcome = fleet
        .state
        .convergence
        .mass_write_config(&ids, &config_slots(&[(0, "120")]))
        .await
        .unwrap();

    assert_eq!(outcome.success.len(), 4);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].device_id, 9999);

    for view in &outcome.success {
        assert_eq!(view.configs.get(0), Some("120"));
        assert!(!view.status.config_updated);
    }
}

#[tokio::test]
async fn device_detail_reflects_all_ledgers() {
    let fleet = TestFleet::new();
    let org = fleet.org("acme").await;
    let profile = fleet.profile(&org, "soil-sensor").await;
    let device = fleet.device(&org, &profile, "dev-1").await;

    fleet
        .state
        .convergence
        .write_config(device.device_id, config_slots(&[(0, "60")]))
        .await
        .unwrap();

    let mut fields = corral_fleet::Slots::<corral_fleet::FieldKind>::new();
    fields.set(0, Some("21.5".to_owned()));
    fleet
        .state
        .ledger
        .record_telemetry(device.writekey.as_str(), fields)
        .await
        .unwrap();

    let mut metadata = corral_fleet::Slots::<corral_fleet::MetadataKind>::new();
    metadata.set(0, Some("greenhouse-3".to_owned()));
    fleet
        .state
        .ledger
        .record_metadata(device.writekey.as_str(), metadata)
        .await
        .unwrap();

    let detail = fleet
        .state
        .registry
        .get_device(&org.id, device.device_id)
        .await
        .unwrap();

    assert_eq!(detail.config_history.len(), 1);
    assert_eq!(detail.telemetry_history.len(), 1);
    assert_eq!(detail.metadata_history.len(), 1);
    assert_eq!(detail.telemetry_history[0].entry_id, 1);
    assert_eq!(detail.config_names.get(0), Some("interval"));

    // The list view picks up the telemetry timestamp.
    let summaries = fleet.state.registry.list_devices(&org.id).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].last_posted_time.is_some());
}

#[tokio::test]
async fn org_push_does_not_rearm_the_device() {
    let fleet = TestFleet::new();
    let org = fleet.org("acme").await;
    let profile = fleet.profile(&org, "soil-sensor").await;
    let device = fleet.device(&org, &profile, "dev-1").await;

    fleet
        .state
        .convergence
        .write_config_preacknowledged(&org.id, device.device_id, config_slots(&[(0, "60")]))
        .await
        .unwrap();

    match fleet
        .state
        .convergence
        .poll_and_ack(&org.id, device.device_id)
        .await
        .unwrap()
    {
        PollOutcome::AlreadyCurrent { .. } => {}
        other => panic!("expected AlreadyCurrent after org push, got {other:?}"),
    }

    // The snapshot itself still exists with the carried data.
    let latest = fleet
        .store
        .latest_config(device.device_id)
        .await
        .unwrap()
        .unwrap();
    assert!(latest.config_updated);
    assert_eq!(latest.values.get(0), Some("60"));
}
