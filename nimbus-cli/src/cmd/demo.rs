use anyhow::Result;
use serde_json::json;
use tracing::info;

use nimbus_client::{DeviceAttributes, IotClient, device_models};

use crate::names;

/// Walks one gateway through the whole lifecycle against a live instance:
/// create, activate as a temperature sensor, acquire a session token, send
/// a telemetry batch, delete.
pub async fn run(client: &IotClient, shared_secret: &str, name: Option<String>) -> Result<()> {
    let name = name.unwrap_or_else(names::generate_gateway_name);

    let gateway = client
        .create_device(shared_secret, &name, DeviceAttributes::default())
        .await?;
    info!(id = %gateway.id(), %name, "gateway created");

    gateway.request_activation_token().await?;
    info!("activation token acquired");

    let policy = gateway.request_activation_policy().await?;
    info!(
        key_type = %policy.key_type,
        key_size = policy.key_size,
        "activation policy acquired"
    );

    gateway
        .activate(&[device_models::TEMPERATURE_SENSOR])
        .await?;
    info!(state = ?gateway.state(), "gateway activated");

    gateway.request_token().await?;

    info!("sending messages...");
    let format = format!("{}:data", device_models::TEMPERATURE_SENSOR);
    let readings = vec![
        json!({"temperature": 18}),
        json!({"temperature": 21}),
        json!({"temperature": 16}),
        json!({"temperature": 11}),
    ];
    gateway.send_data_messages(&format, readings, None).await?;
    info!("messages sent");

    gateway.delete().await?;
    info!("gateway deleted");

    Ok(())
}
