use std::time::Duration;

use nimbus_util::http::Uri;

use crate::protocol::ProtocolVersion;

/// Client configuration.
///
/// Everything that used to be ambient state in older client libraries
/// (shared transport defaults, process-wide TLS-verification toggles) is an
/// explicit field here and scoped to the client built from this config.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URI of the cloud service, e.g. `https://cloud.example.com:443`.
    pub endpoint: Uri,

    /// Maximum time to wait for a single request to complete.
    pub request_timeout: Duration,

    /// Accept self-signed server certificates. Never enable outside of
    /// development instances.
    pub accept_invalid_certs: bool,

    /// Protocol version to start with. Can be revised later through
    /// API-version discovery.
    pub version: ProtocolVersion,

    /// OS name reported with activation policy requests.
    pub os_name: String,

    /// OS version reported with activation policy requests.
    pub os_version: String,
}

impl ClientConfig {
    pub fn new(endpoint: Uri) -> Self {
        Self {
            endpoint,
            request_timeout: Duration::from_millis(30_000),
            accept_invalid_certs: false,
            version: ProtocolVersion::V2,
            os_name: std::env::consts::OS.to_owned(),
            os_version: "unknown".to_owned(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }
}
