use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use nimbus_util::crypto::KeyPair;
use nimbus_util::http::Uri;
use nimbus_util::types::{EndpointId, SharedSecret};

use crate::config::ClientConfig;
use crate::credentials::{CredentialSource, EnterpriseApplication};
use crate::device::Device;
use crate::error::ClientError;
use crate::message::epoch_millis;
use crate::models::{ApiVersions, DeviceAttributes, DeviceRecord, DeviceState, ListPage};
use crate::protocol::ProtocolVersion;

/// Handle to the device-cloud REST service.
///
/// Cheap to clone; all clones share the underlying transport, credentials
/// and protocol version. Directory operations authenticate with the
/// configured principal or enterprise application and retry exactly once on
/// 401 by clearing and re-deriving credentials.
#[derive(Clone)]
pub struct IotClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
    keys: Arc<KeyPair>,
    version: RwLock<ProtocolVersion>,
    credentials: RwLock<Option<CredentialSource>>,
}

impl IotClient {
    pub fn new(config: ClientConfig, keys: KeyPair) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                version: RwLock::new(config.version),
                config,
                keys: Arc::new(keys),
                credentials: RwLock::new(None),
            }),
        })
    }

    /// Authenticates directory operations with a basic-auth principal.
    pub fn set_principal(&self, username: impl Into<String>, password: impl Into<String>) {
        *self.inner.credentials.write().expect("lock poisoned") =
            Some(CredentialSource::Principal {
                username: username.into(),
                password: password.into(),
            });
    }

    /// Authenticates directory operations through an enterprise application
    /// bearer token.
    pub fn set_enterprise(&self, application: EnterpriseApplication) {
        *self.inner.credentials.write().expect("lock poisoned") =
            Some(CredentialSource::Enterprise(application));
    }

    pub fn version(&self) -> ProtocolVersion {
        *self.inner.version.read().expect("lock poisoned")
    }

    pub fn set_version(&self, version: ProtocolVersion) {
        *self.inner.version.write().expect("lock poisoned") = version;
    }

    /// Discovers the API version the server reports as latest and adopts it.
    #[instrument(skip_all, err)]
    pub async fn check_version(&self) -> Result<ProtocolVersion, ClientError> {
        let request = self.http().get(self.url(ProtocolVersion::api_root(), None)?);
        let value = self.send_authorized(request, StatusCode::OK).await?;
        let versions: ApiVersions = serde_json::from_value(value)?;

        let reported = match versions.items.as_slice() {
            [single] => &single.version,
            items => items
                .iter()
                .find(|v| v.is_latest)
                .map(|v| &v.version)
                .ok_or_else(|| ClientError::UnsupportedVersion("unreported".to_owned()))?,
        };
        let version = ProtocolVersion::try_from(reported.as_str())?;

        debug!(version = version.as_str(), "adopting reported API version");
        self.set_version(version);
        Ok(version)
    }

    /// Wraps an already-registered device identity without any server
    /// round-trip.
    pub fn provision_device(
        &self,
        id: impl Into<EndpointId>,
        shared_secret: impl Into<SharedSecret>,
        state: DeviceState,
    ) -> Device {
        Device::new(id.into(), shared_secret.into(), state, self.clone())
    }

    /// Registers a new directly-connected device.
    pub async fn create_device(
        &self,
        shared_secret: impl Into<SharedSecret>,
        name: &str,
        attributes: DeviceAttributes,
    ) -> Result<Device, ClientError> {
        self.create_device_of_type(shared_secret, name, "DIRECTLY_CONNECTED_DEVICE", attributes)
            .await
    }

    /// Registers a new gateway. The distinct device type only matters on V1;
    /// V2 treats gateways as regular devices until they enroll children.
    pub async fn create_gateway(
        &self,
        shared_secret: impl Into<SharedSecret>,
        name: &str,
        attributes: DeviceAttributes,
    ) -> Result<Device, ClientError> {
        self.create_device_of_type(shared_secret, name, "SMART_DEVICE", attributes)
            .await
    }

    async fn create_device_of_type(
        &self,
        shared_secret: impl Into<SharedSecret>,
        name: &str,
        device_type: &str,
        attributes: DeviceAttributes,
    ) -> Result<Device, ClientError> {
        let shared_secret = shared_secret.into();
        let body = self.device_creation_body(&shared_secret, name, device_type, attributes);

        let request = self
            .http()
            .post(self.url(self.version().directory_path(), None)?)
            .json(&body);
        let value = self.send_authorized(request, StatusCode::CREATED).await?;
        let record: DeviceRecord = serde_json::from_value(value)?;

        debug!(device = %record.id, "device created");
        Ok(Device::new(
            record.id.into(),
            shared_secret,
            record.state,
            self.clone(),
        ))
    }

    fn device_creation_body(
        &self,
        shared_secret: &SharedSecret,
        name: &str,
        device_type: &str,
        attributes: DeviceAttributes,
    ) -> Value {
        let time = epoch_millis();
        let DeviceAttributes {
            description,
            manufacturer,
            model_number,
            serial_number,
            metadata,
        } = attributes;

        let description = description.unwrap_or_else(|| format!("nimbus-description-{time}"));
        let manufacturer = manufacturer.unwrap_or_else(|| format!("nimbus-manufacturer-{time}"));
        let model_number = model_number.unwrap_or_else(|| format!("nimbus-modelNumber-{time}"));
        let serial_number = serial_number.unwrap_or_else(|| format!("nimbus-serialNumber-{time}"));
        let secret = BASE64.encode(shared_secret.as_bytes());

        match self.version() {
            ProtocolVersion::V1 => {
                let mut body = json!({
                    "type": device_type,
                    "sharedSecret": secret,
                    "endpointName": name,
                    "description": description,
                    "manufacturer": manufacturer,
                    "modelNumber": model_number,
                    "serialNumber": serial_number,
                });
                if !metadata.is_empty() {
                    body["metadata"] = json!({ "items": metadata });
                }
                body
            }
            ProtocolVersion::V2 => {
                let mut body = json!({
                    "sharedSecret": secret,
                    "name": name,
                    "description": description,
                    "manufacturer": manufacturer,
                    "modelNumber": model_number,
                    "serialNumber": serial_number,
                });
                if !metadata.is_empty() {
                    body["metadata"] = Value::Object(metadata);
                }
                body
            }
        }
    }

    /// Opens an already-registered device by id.
    pub async fn get_device(
        &self,
        id: &EndpointId,
        shared_secret: impl Into<SharedSecret>,
    ) -> Result<Device, ClientError> {
        let path = format!("{}/{id}", self.version().directory_path());
        let request = self.http().get(self.url(&path, None)?);
        let value = self.send_authorized(request, StatusCode::OK).await?;
        let record: DeviceRecord = serde_json::from_value(value)?;

        Ok(Device::new(
            record.id.into(),
            shared_secret.into(),
            record.state,
            self.clone(),
        ))
    }

    pub async fn disable_device(&self, id: &EndpointId) -> Result<(), ClientError> {
        let path = format!("{}/{id}", self.version().directory_path());
        let request = self
            .http()
            .post(self.url(&path, None)?)
            .header("X-HTTP-Method-Override", "PATCH")
            .json(&json!({ "state": "DISABLED" }));
        self.send_authorized(request, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn delete_device(&self, id: &EndpointId) -> Result<(), ClientError> {
        let path = format!("{}/{id}", self.version().directory_path());
        let request = self.http().delete(self.url(&path, None)?);
        self.send_authorized(request, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// Lists devices. `query` is serialized as a JSON-encoded string under
    /// the `q` parameter; offset and limit are sent only when given.
    pub async fn list_devices(
        &self,
        query: Option<&Value>,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ListPage, ClientError> {
        let request = self
            .http()
            .get(self.url(ProtocolVersion::V2.directory_path(), None)?)
            .query(&listing_query(query, offset, limit));
        let value = self.send_authorized(request, StatusCode::OK).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// V1 endpoint listing, expanded with metadata and resources.
    pub async fn list_endpoints(
        &self,
        query: Option<&Value>,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ListPage, ClientError> {
        let mut pairs = vec![("expand", "metadata,resources".to_owned())];
        pairs.extend(listing_query(query, offset, limit));

        let request = self
            .http()
            .get(self.url(ProtocolVersion::V1.directory_path(), None)?)
            .query(&pairs);
        let value = self.send_authorized(request, StatusCode::OK).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_application(
        &self,
        name: &str,
        description: Option<&str>,
        device_models: &[&str],
    ) -> Result<Value, ClientError> {
        let mut body = json!({
            "name": name,
            "description": description.unwrap_or("default description"),
        });
        if !device_models.is_empty() {
            body["deviceModelURNs"] = json!(device_models);
        }

        let request = self
            .http()
            .post(self.url(self.version().apps_path(), None)?)
            .json(&body);
        self.send_authorized(request, StatusCode::CREATED).await
    }

    pub async fn list_applications(&self) -> Result<ListPage, ClientError> {
        let request = self.http().get(self.url(self.version().apps_path(), None)?);
        let value = self.send_authorized(request, StatusCode::OK).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_device_model(&self, device_model: &Value) -> Result<Value, ClientError> {
        let request = self
            .http()
            .post(self.url(self.version().device_models_path(), None)?)
            .json(device_model);
        self.send_authorized(request, StatusCode::CREATED).await
    }

    /// Queries stored messages. Exactly one of `connector`, `device` or
    /// `type` is expected by the server; paging options may be combined
    /// freely.
    pub async fn get_messages(&self, options: &[(&str, &str)]) -> Result<ListPage, ClientError> {
        let request = self
            .http()
            .get(self.url(self.version().messages_path(), None)?)
            .query(options);
        let value = self.send_authorized(request, StatusCode::OK).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Reads (no data) or writes (with data) a device resource. Returns the
    /// async-request token the server replies with.
    pub async fn request_device_resource(
        &self,
        device_id: &EndpointId,
        resource: &str,
        data: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let path = format!(
            "{}/{device_id}/resources/{resource}",
            self.version().directory_path()
        );
        let url = self.url(&path, Some("iot.async"))?;
        let request = match data {
            Some(data) => self.http().put(url).json(data),
            None => self.http().get(url),
        };
        self.send_authorized(request, StatusCode::ACCEPTED).await
    }

    pub async fn get_endpoint(
        &self,
        id: &EndpointId,
        params: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let path = format!("{}/{id}", self.version().directory_path());
        let request = self.http().get(self.url(&path, None)?).query(params);
        self.send_authorized(request, StatusCode::OK).await
    }

    pub async fn update_endpoint(
        &self,
        id: &EndpointId,
        payload: &Value,
        patch: bool,
    ) -> Result<Value, ClientError> {
        let path = format!("{}/{id}", self.version().directory_path());
        let mut request = self.http().post(self.url(&path, None)?).json(payload);
        if patch {
            request = request.header("X-HTTP-Method-Override", "PATCH");
        }
        self.send_authorized(request, StatusCode::OK).await
    }

    /// Sends a request with the configured credentials, checking for the
    /// expected status code. On 401 with invalidable (enterprise)
    /// credentials the request is re-derived and re-sent exactly once.
    pub(crate) async fn send_authorized(
        &self,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<Value, ClientError> {
        let retry = request.try_clone();

        match self.send_with_credentials(request, expected).await {
            Err(e) if e.is_unauthorized() && self.invalidate_credentials() => {
                let Some(retry) = retry else { return Err(e) };
                warn!("credentials rejected, retrying with fresh token");
                self.send_with_credentials(retry, expected).await
            }
            other => other,
        }
    }

    async fn send_with_credentials(
        &self,
        mut request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<Value, ClientError> {
        let credentials = self
            .inner
            .credentials
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(ClientError::NoCredentials)?;

        request = match credentials {
            CredentialSource::Principal { username, password } => {
                request.basic_auth(username, Some(password))
            }
            CredentialSource::Enterprise(application) => {
                let headers = application.authorization_headers(self).await?;
                headers
                    .into_iter()
                    .fold(request, |request, (name, value)| request.header(name, value))
            }
        };

        let response = request.timeout(self.request_timeout()).send().await?;
        if response.status() != expected {
            return Err(ClientError::from_response(response).await);
        }

        let body = response.text().await?;
        if body.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&body)?)
        }
    }

    /// Clears enterprise credentials after a 401. Returns whether a retry
    /// makes sense, i.e. whether there were cached credentials to discard.
    fn invalidate_credentials(&self) -> bool {
        let credentials = self.inner.credentials.read().expect("lock poisoned");
        match credentials.as_ref() {
            Some(CredentialSource::Enterprise(application)) if application.has_credentials() => {
                application.clear_credentials();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub(crate) fn url(&self, path: &str, query: Option<&str>) -> Result<String, ClientError> {
        Ok(Uri::from_parts(&self.inner.config.endpoint, path, query)?.to_string())
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    pub(crate) fn keys(&self) -> &Arc<KeyPair> {
        &self.inner.keys
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

/// Builds the listing query pairs: `q` carries the JSON-encoded query, and
/// offset/limit appear only when actually provided.
fn listing_query(
    query: Option<&Value>,
    offset: Option<u32>,
    limit: Option<u32>,
) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(query) = query {
        pairs.push(("q", query.to_string()));
    }
    if let Some(offset) = offset {
        pairs.push(("offset", offset.to_string()));
    }
    if let Some(limit) = limit {
        pairs.push(("limit", limit.to_string()));
    }
    pairs
}
