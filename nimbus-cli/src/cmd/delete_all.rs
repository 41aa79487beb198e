use anyhow::Result;
use serde_json::json;
use std::time::Instant;
use tracing::{info, warn};

use nimbus_client::{DeviceState, IotClient};

const PAGE_SIZE: u32 = 200;

/// Deletes every device that is not already decommissioned, page by page.
pub async fn run(client: &IotClient) -> Result<()> {
    let started = Instant::now();
    let query = json!({"state": {"$ne": "DECOMMISSIONED"}});
    let mut total = 0u32;

    loop {
        let page = client
            .list_devices(Some(&query), Some(0), Some(PAGE_SIZE))
            .await?;
        if page.items.is_empty() {
            break;
        }

        let mut deleted = 0u32;
        for item in &page.items {
            let Some(id) = item["id"].as_str() else {
                continue;
            };
            let device = client.provision_device(id, "", DeviceState::Registered);
            match device.delete().await {
                Ok(()) => {
                    info!(id, "device deleted");
                    deleted += 1;
                }
                Err(error) => warn!(id, %error, "delete failed"),
            }
        }
        total += deleted;

        // nothing deleted on a full page means we are only re-listing
        // failures, stop rather than spin
        if !page.has_more || deleted == 0 {
            break;
        }
        info!("next page");
    }

    info!(total, elapsed = ?started.elapsed(), "all devices deleted");
    Ok(())
}
