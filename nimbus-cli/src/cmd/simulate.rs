use anyhow::Result;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use nimbus_client::{Device, DeviceState, IotClient, Severity, device_models};

const MAX_DEVICES: u32 = 100;
const TEMPERATURE_RANGE: std::ops::Range<i32> = -50..50;
const ALERT_THRESHOLD: i32 = 35;

/// Has every activated device send a randomized temperature reading per
/// round, raising an alert when the reading crosses the threshold.
pub async fn run(
    client: &IotClient,
    shared_secret: &str,
    interval_ms: u64,
    rounds: u32,
) -> Result<()> {
    let page = client
        .list_devices(
            Some(&json!({"state": "ACTIVATED"})),
            Some(0),
            Some(MAX_DEVICES),
        )
        .await?;

    let devices: Vec<Device> = page
        .items
        .iter()
        .filter_map(|item| item["id"].as_str())
        .map(|id| client.provision_device(id, shared_secret, DeviceState::Activated))
        .collect();
    if devices.is_empty() {
        warn!("no activated devices to simulate");
        return Ok(());
    }
    info!(devices = devices.len(), rounds, "starting simulation");

    let format = format!("{}:data", device_models::TEMPERATURE_SENSOR);
    let alert_format = format!("{}:alert", device_models::TEMPERATURE_SENSOR);
    let mut messages = 0u32;
    let mut alerts = 0u32;

    for round in 0..rounds {
        for device in &devices {
            let reading = rand::thread_rng().gen_range(TEMPERATURE_RANGE);

            if let Err(error) = device
                .send_data_messages(&format, json!({"temperature": reading}), None)
                .await
            {
                warn!(id = %device.id(), %error, "send failed");
                continue;
            }
            messages += 1;

            if reading > ALERT_THRESHOLD {
                let alert = device
                    .send_alerts(
                        &alert_format,
                        "it is getting hot in here",
                        Severity::Significant,
                        json!({"temperature": reading}),
                        None,
                    )
                    .await;
                match alert {
                    Ok(()) => alerts += 1,
                    Err(error) => warn!(id = %device.id(), %error, "alert failed"),
                }
            }
        }

        info!(round = round + 1, messages, alerts, "round complete");
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }

    info!(messages, alerts, "simulation finished");
    Ok(())
}
