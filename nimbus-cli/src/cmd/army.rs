use anyhow::Result;
use rand::Rng;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use nimbus_client::{Device, DeviceAttributes, IotClient};

use crate::names;

// Fleet shape. Roughly half of the devices become gateways with children,
// the rest split between plain activated, disabled and never-activated.
const GATEWAY_LIKELIHOOD: f64 = 0.5;
const ACTIVATION_LIKELIHOOD: f64 = 0.5;
const DISABLED_LIKELIHOOD: f64 = 0.25;
const GATEWAY_CHILDREN_MIN: u32 = 10;
const GATEWAY_CHILDREN_MAX: u32 = 30;
const REST_TIME: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Counters {
    devices: u32,
    gateways: u32,
    children: u32,
    disabled: u32,
    errors: u32,
}

/// Populates the instance with a randomized fleet of `count`
/// directly-connected devices, some of which become gateways that enroll
/// indirectly-connected children.
pub async fn run(client: &IotClient, count: u32, shared_secret: &str) -> Result<()> {
    let started = Instant::now();
    let mut counters = Counters::default();

    for _ in 0..count {
        if let Err(error) = build_device(client, shared_secret, &mut counters).await {
            warn!(%error, "device creation failed");
            counters.errors += 1;
        }
        // a little rest keeps small instances responsive
        tokio::time::sleep(REST_TIME).await;
    }

    info!(
        devices = counters.devices,
        gateways = counters.gateways,
        children = counters.children,
        disabled = counters.disabled,
        errors = counters.errors,
        elapsed = ?started.elapsed(),
        "fleet created"
    );
    Ok(())
}

async fn build_device(
    client: &IotClient,
    shared_secret: &str,
    counters: &mut Counters,
) -> Result<()> {
    let (is_gateway, should_activate, should_disable, children) = {
        let mut rng = rand::thread_rng();
        (
            rng.gen_bool(GATEWAY_LIKELIHOOD),
            rng.gen_bool(ACTIVATION_LIKELIHOOD),
            rng.gen_bool(DISABLED_LIKELIHOOD),
            rng.gen_range(GATEWAY_CHILDREN_MIN..=GATEWAY_CHILDREN_MAX),
        )
    };

    let attributes = DeviceAttributes {
        manufacturer: Some(names::random_manufacturer().to_owned()),
        model_number: Some(names::random_model_number()),
        serial_number: Some(names::random_serial_number()),
        ..Default::default()
    };

    if is_gateway {
        let gateway = client
            .create_gateway(shared_secret, &names::generate_gateway_name(), attributes)
            .await?;
        counters.devices += 1;

        gateway.activate(&[]).await?;
        counters.gateways += 1;
        counters.children += enroll_children(&gateway, children).await?;
        info!(id = %gateway.id(), children, "gateway created");
        return Ok(());
    }

    let device = client
        .create_device(shared_secret, &names::generate_device_name(), attributes)
        .await?;
    counters.devices += 1;

    if should_activate {
        device.activate(&[]).await?;
        if should_disable {
            device.disable().await?;
            counters.disabled += 1;
        }
    }
    info!(id = %device.id(), "device created");
    Ok(())
}

async fn enroll_children(gateway: &Device, count: u32) -> Result<u32> {
    let mut enrolled = 0;
    for _ in 0..count {
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "manufacturer".to_owned(),
            json!(names::random_manufacturer()),
        );
        attributes.insert("serialNumber".to_owned(), json!(names::random_serial_number()));

        gateway.indirect_enroll(attributes).await?;
        enrolled += 1;
    }
    Ok(enrolled)
}
