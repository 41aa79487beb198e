use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a device identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    #[default]
    Registered,
    Activated,
    Disabled,
    Decommissioned,
}

/// Key parameters the cloud expects activation requests to use.
///
/// Fetched fresh per activation attempt because key size and algorithm may
/// differ per server configuration; cached on the identity only until
/// activation completes.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPolicy {
    #[serde(default = "default_certificate_format")]
    pub format: String,
    pub key_type: String,
    pub key_size: u32,
    pub hash_algorithm: String,
}

fn default_certificate_format() -> String {
    "X.509".to_owned()
}

/// Body of a successful token grant.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    pub token_type: String,
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Body of a successful direct activation.
#[derive(Clone, Debug, Deserialize)]
pub struct ActivationResponse {
    #[serde(rename = "endpointState")]
    pub endpoint_state: DeviceState,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// Stored device/endpoint resource as returned by directory operations.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub state: DeviceState,
}

/// One page of a directory listing.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, rename = "hasMore")]
    pub has_more: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ApiVersions {
    pub items: Vec<ApiVersionInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ApiVersionInfo {
    pub version: String,
    #[serde(default, rename = "isLatest")]
    pub is_latest: bool,
}

/// Optional attributes for device creation. Whatever is left unset gets a
/// generated placeholder, mirroring what the cloud would otherwise reject.
#[derive(Clone, Debug, Default)]
pub struct DeviceAttributes {
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    /// Free-form metadata items attached to the device.
    pub metadata: serde_json::Map<String, Value>,
}
