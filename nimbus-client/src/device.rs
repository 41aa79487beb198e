use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::FutureExt;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

use nimbus_util::crypto::hmac_sha256_base64;
use nimbus_util::types::{EndpointId, SharedSecret};

use crate::client::IotClient;
use crate::credentials::SharedTokenFetch;
use crate::error::{ClientError, TokenError};
use crate::message::{Data, Message, MessageType, Severity, epoch_millis};
use crate::models::{
    ActivationPolicy, ActivationResponse, DeviceState, ListPage, TokenResponse,
};
use crate::protocol::{
    JWT_ASSERTION_TYPE, ProtocolVersion, SCOPE_ACTIVATION, SCOPE_SESSION, TOKEN_AUDIENCE,
};

/// A device identity: id, shared secret, lifecycle state and, once
/// activated, certificate and bearer token.
///
/// Cheap to clone; clones share the identity. All state transitions happen
/// through the activation protocol or directory operations, and every field
/// is written only after the corresponding request succeeded, so a failed
/// attempt can simply be retried.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: EndpointId,
    shared_secret: SharedSecret,
    client: IotClient,
    state: Mutex<IdentityState>,
    token_fetch: Mutex<Option<SharedTokenFetch>>,
}

#[derive(Default)]
struct IdentityState {
    lifecycle: DeviceState,
    token: Option<SessionToken>,
    policy: Option<ActivationPolicy>,
    certificate: Option<String>,
}

#[derive(Clone, Debug)]
struct SessionToken {
    token_type: String,
    access_token: String,
    scope: String,
}

impl Device {
    pub(crate) fn new(
        id: EndpointId,
        shared_secret: SharedSecret,
        state: DeviceState,
        client: IotClient,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id,
                shared_secret,
                client,
                state: Mutex::new(IdentityState {
                    lifecycle: state,
                    ..Default::default()
                }),
                token_fetch: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.inner.id
    }

    pub fn client(&self) -> &IotClient {
        &self.inner.client
    }

    pub fn state(&self) -> DeviceState {
        self.inner.state.lock().expect("lock poisoned").lifecycle
    }

    /// Scope of the currently held token: activation scope during the
    /// activation handshake, "" once a session token has been issued, None
    /// before any token was loaded.
    pub fn token_scope(&self) -> Option<String> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.token.as_ref().map(|token| token.scope.clone())
    }

    /// Certificate returned by a successful activation.
    pub fn certificate(&self) -> Option<String> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.certificate.clone()
    }

    pub fn activation_policy(&self) -> Option<ActivationPolicy> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.policy.clone()
    }

    /// Header pairs authorizing a request as this device, or None until a
    /// token has been loaded. The id travels as `X-ActivationId` before
    /// activation and as `X-EndpointId` afterwards.
    pub fn authorization_headers(&self) -> Option<[(&'static str, String); 2]> {
        let state = self.inner.state.lock().expect("lock poisoned");
        let token = state.token.as_ref()?;
        let id_header = if state.lifecycle == DeviceState::Activated {
            "X-EndpointId"
        } else {
            "X-ActivationId"
        };
        Some([
            (
                "Authorization",
                format!("{} {}", token.token_type, token.access_token),
            ),
            (id_header, self.inner.id.to_string()),
        ])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.authorization_headers() {
            Some(headers) => headers
                .into_iter()
                .fold(request, |request, (name, value)| request.header(name, value)),
            None => request,
        }
    }

    fn load_token(&self, token: TokenResponse, scope: &str) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        state.token = Some(SessionToken {
            token_type: token.token_type,
            access_token: token.access_token,
            scope: scope.to_owned(),
        });
    }

    fn holds_session_token(&self) -> bool {
        let state = self.inner.state.lock().expect("lock poisoned");
        state
            .token
            .as_ref()
            .is_some_and(|token| token.scope == SCOPE_SESSION)
    }

    /// Requests an activation-scoped token using the HMAC shared-secret
    /// grant. First step of the activation handshake.
    #[instrument(skip_all, fields(device = %self.id()), err)]
    pub async fn request_activation_token(&self) -> Result<(), ClientError> {
        let client = &self.inner.client;
        let id = self.id();
        let secret = &self.inner.shared_secret;
        let hash = hmac_sha256_base64(secret.as_bytes(), format!("{id}\n{secret}").as_bytes());

        let form = [
            ("grant_type", "client_credentials".to_owned()),
            ("client_id", id.to_string()),
            ("scope", SCOPE_ACTIVATION.to_owned()),
            ("client_secret", format!("HmacSHA256:{hash}")),
        ];

        let response = client
            .http()
            .post(client.url(client.version().token_path(), None)?)
            .timeout(client.request_timeout())
            .form(&form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }

        let token: TokenResponse = response.json().await?;
        self.load_token(token, SCOPE_ACTIVATION);
        debug!("activation token acquired");
        Ok(())
    }

    /// Fetches the key parameters the cloud expects activation requests to
    /// use. Requires an activation-scoped token.
    #[instrument(skip_all, fields(device = %self.id()), err)]
    pub async fn request_activation_policy(&self) -> Result<ActivationPolicy, ClientError> {
        let client = &self.inner.client;
        let config = client.config();
        let url = client.url(client.version().policy_path(), None)?;

        let request = match client.version() {
            ProtocolVersion::V1 => client.http().post(url).json(&json!({
                "deviceAttributes": {
                    "OSName": &config.os_name,
                    "OSVersion": &config.os_version,
                }
            })),
            ProtocolVersion::V2 => client.http().get(url).query(&[
                ("OSName", config.os_name.as_str()),
                ("OSVersion", config.os_version.as_str()),
            ]),
        };

        let response = self
            .authorize(request)
            .timeout(client.request_timeout())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }

        let policy: ActivationPolicy = response.json().await?;
        self.inner.state.lock().expect("lock poisoned").policy = Some(policy.clone());
        debug!(key_type = %policy.key_type, key_size = policy.key_size, "activation policy acquired");
        Ok(policy)
    }

    /// Runs the activation handshake: activation token, policy, then the
    /// signed certificate request, strictly in that order. Skips straight
    /// to the certificate request when a policy is already cached from an
    /// earlier attempt.
    ///
    /// An empty `device_models` slice selects the default device model; the
    /// `direct_activation` capability is always included.
    #[instrument(skip_all, fields(device = %self.id()), err)]
    pub async fn activate(&self, device_models: &[&str]) -> Result<(), ClientError> {
        if self.activation_policy().is_none() {
            self.request_activation_token().await?;
            self.request_activation_policy().await?;
        }
        self.submit_activation(device_models).await
    }

    async fn submit_activation(&self, device_models: &[&str]) -> Result<(), ClientError> {
        let client = &self.inner.client;
        let policy = self.activation_policy().ok_or(ClientError::MissingPolicy)?;
        let payload = client.version().build_activation_payload(
            self.id(),
            &self.inner.shared_secret,
            &policy,
            client.keys(),
            device_models,
        )?;

        let request = client
            .http()
            .post(client.url(client.version().activation_path(), None)?)
            .json(&payload);
        let response = self
            .authorize(request)
            .timeout(client.request_timeout())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }

        let activation: ActivationResponse = response.json().await?;
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.lifecycle = activation.endpoint_state;
            state.certificate = activation.certificate;
            // the policy is only meaningful within one activation attempt
            state.policy = None;
        }
        debug!(state = ?activation.endpoint_state, "device activated");
        Ok(())
    }

    /// Requests a session token using the RS256-signed client assertion.
    ///
    /// Single-flight: a second caller arriving while a fetch is outstanding
    /// awaits the same pending fetch rather than issuing a duplicate
    /// request. The cloud issues at most one valid token per endpoint, so a
    /// duplicate fetch would invalidate the token concurrent operations
    /// still depend on. The in-flight marker is cleared once the fetch
    /// resolves, on success and failure alike.
    pub async fn request_token(&self) -> Result<(), TokenError> {
        let fetch = {
            let mut pending = self.inner.token_fetch.lock().expect("lock poisoned");
            match pending.as_ref() {
                Some(fetch) => fetch.clone(),
                None => {
                    let device = self.clone();
                    let fetch = async move {
                        let result = device.fetch_session_token().await;
                        if let Ok(token) = &result {
                            device.load_token(token.clone(), SCOPE_SESSION);
                        }
                        device
                            .inner
                            .token_fetch
                            .lock()
                            .expect("lock poisoned")
                            .take();
                        result.map_err(|e| TokenError(Arc::new(e)))
                    }
                    .boxed()
                    .shared();
                    *pending = Some(fetch.clone());
                    fetch
                }
            }
        };

        fetch.await.map(|_| ())
    }

    async fn fetch_session_token(&self) -> Result<TokenResponse, ClientError> {
        let client = &self.inner.client;
        let id = self.id();

        let header = json!({"typ": "JWT", "alg": "RS256", "cty": null});
        let claims = json!({
            "iss": id.as_str(),
            "sub": null,
            "aud": TOKEN_AUDIENCE,
            "exp": epoch_millis() / 1000 + 15 * 60,
            "nbf": null,
            "iat": 0,
            "jti": null,
            "typ": null,
        });
        let assertion = format!(
            "{}.{}",
            BASE64.encode(header.to_string()),
            BASE64.encode(claims.to_string())
        );
        let signature = client.keys().sign_sha256_base64(assertion.as_bytes());

        debug!(device = %id, "requesting session token");
        let form = [
            ("grant_type", "client_credentials".to_owned()),
            ("client_assertion_type", JWT_ASSERTION_TYPE.to_owned()),
            ("client_assertion", format!("{assertion}.{signature}")),
            ("scope", SCOPE_SESSION.to_owned()),
        ];

        let response = client
            .http()
            .post(client.url(client.version().token_path(), None)?)
            .timeout(client.request_timeout())
            .form(&form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Sends data message(s) of the given format. `source` overrides the
    /// message source, e.g. when a gateway forwards on behalf of a child.
    pub async fn send_data_messages(
        &self,
        format: &str,
        data: impl Into<Data>,
        source: Option<&EndpointId>,
    ) -> Result<(), ClientError> {
        let payloads = data
            .into()
            .into_items()
            .into_iter()
            .map(|item| json!({"format": format, "data": item}))
            .collect();
        self.send_messages(MessageType::Data, payloads, source).await
    }

    pub async fn send_alerts(
        &self,
        format: &str,
        description: &str,
        severity: Severity,
        data: impl Into<Data>,
        source: Option<&EndpointId>,
    ) -> Result<(), ClientError> {
        let payloads = data
            .into()
            .into_items()
            .into_iter()
            .map(|item| {
                json!({
                    "format": format,
                    "description": description,
                    "severity": severity,
                    "data": item,
                })
            })
            .collect();
        self.send_messages(MessageType::Alert, payloads, source).await
    }

    /// Sends pre-built response payload(s) as-is.
    pub async fn send_response_messages(&self, data: impl Into<Data>) -> Result<(), ClientError> {
        self.send_messages(MessageType::Response, data.into().into_items(), None)
            .await
    }

    pub async fn send_resources_report(&self, resources: Value) -> Result<(), ClientError> {
        let payload = json!({
            "type": "JSON",
            "value": {
                "reportType": "UPDATE",
                "endpointName": self.id().as_str(),
                "resources": resources,
            }
        });
        self.send_messages(MessageType::ResourcesReport, vec![payload], None)
            .await
    }

    async fn send_messages(
        &self,
        message_type: MessageType,
        payloads: Vec<Value>,
        source: Option<&EndpointId>,
    ) -> Result<(), ClientError> {
        let source = source.unwrap_or_else(|| self.id());
        let messages = Message::batch(message_type, source.as_str(), payloads);

        // An activation-scoped token cannot submit data; refresh unless we
        // already hold a session-scoped one.
        if !self.holds_session_token() {
            self.request_token().await?;
        }
        self.send_messages_raw(&messages).await
    }

    /// Posts an envelope batch, expecting 202. A 401 triggers one token
    /// refresh and resubmission; a second 401 propagates as a failure.
    async fn send_messages_raw(&self, messages: &[Message]) -> Result<(), ClientError> {
        let client = &self.inner.client;
        let mut retried = false;

        loop {
            let request = client
                .http()
                .post(client.url(client.version().messages_path(), None)?)
                .json(messages);
            let response = self
                .authorize(request)
                .timeout(client.request_timeout())
                .send()
                .await?;

            match response.status() {
                StatusCode::ACCEPTED => return Ok(()),
                StatusCode::UNAUTHORIZED if !retried => {
                    retried = true;
                    debug!(device = %self.id(), "message submission rejected, refreshing token");
                    self.request_token().await?;
                }
                _ => return Err(ClientError::from_response(response).await),
            }
        }
    }

    /// Enrolls a single indirectly-connected device under this gateway.
    /// Mandatory attributes the caller left out are filled with generated
    /// placeholders. Returns the enrollment response, which carries the
    /// child's endpoint id.
    #[instrument(skip_all, fields(gateway = %self.id()), err)]
    pub async fn indirect_enroll(
        &self,
        attributes: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let client = &self.inner.client;
        let attributes = client.version().enrollment_attributes(attributes);

        if !self.holds_session_token() {
            self.request_token().await?;
        }

        let request = client
            .http()
            .post(client.url(client.version().indirect_activation_path(), None)?)
            .json(&Value::Object(attributes));
        let response = self
            .authorize(request)
            .timeout(client.request_timeout())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Lists this gateway's children that are not decommissioned.
    pub async fn children(
        &self,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ListPage, ClientError> {
        let client = &self.inner.client;
        let offset = offset.or(Some(0));
        let limit = limit.or(Some(200));
        let query = client.version().children_query(self.id());

        match client.version() {
            ProtocolVersion::V1 => client.list_endpoints(Some(&query), offset, limit).await,
            ProtocolVersion::V2 => client.list_devices(Some(&query), offset, limit).await,
        }
    }

    pub async fn disable(&self) -> Result<(), ClientError> {
        self.inner.client.disable_device(self.id()).await
    }

    pub async fn delete(&self) -> Result<(), ClientError> {
        self.inner.client.delete_device(self.id()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::test_support::test_keys;
    use mockito::{Matcher, Server, ServerGuard};

    const TOKEN_PATH: &str = "/iot/api/v1/oauth2/token";
    const MESSAGES_PATH: &str = "/iot/api/v2/messages";

    fn device_for(server: &ServerGuard) -> Device {
        let config = ClientConfig::new(server.url().parse().unwrap());
        let client = IotClient::new(config, test_keys().clone()).unwrap();
        client.provision_device("AAAA-0001", "secret", DeviceState::Registered)
    }

    fn token_body(access_token: &str) -> String {
        format!(r#"{{"token_type": "Bearer", "access_token": "{access_token}"}}"#)
    }

    #[tokio::test]
    async fn authorization_headers_follow_the_activation_lifecycle() {
        let mut server = Server::new_async().await;
        let device = device_for(&server);

        // no token loaded yet
        assert!(device.authorization_headers().is_none());

        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "AAAA-0001".into()),
                Matcher::UrlEncoded("scope".into(), SCOPE_ACTIVATION.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("activation-token"))
            .create_async()
            .await;

        device.request_activation_token().await.unwrap();
        let headers = device.authorization_headers().unwrap();
        assert_eq!(
            headers[0],
            ("Authorization", "Bearer activation-token".to_owned())
        );
        assert_eq!(headers[1], ("X-ActivationId", "AAAA-0001".to_owned()));
        assert_eq!(device.token_scope().as_deref(), Some(SCOPE_ACTIVATION));

        let policy_mock = server
            .mock("GET", "/iot/api/v2/activation/policy")
            .match_query(Matcher::UrlEncoded("OSName".into(), std::env::consts::OS.into()))
            .match_header("x-activationid", "AAAA-0001")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"keyType": "RSA", "keySize": 2048, "hashAlgorithm": "SHA256withRSA"}"#)
            .create_async()
            .await;

        let policy = device.request_activation_policy().await.unwrap();
        assert_eq!(policy.format, "X.509");
        assert_eq!(policy.key_size, 2048);

        let activation_mock = server
            .mock("POST", "/iot/api/v2/activation/direct")
            .match_header("x-activationid", "AAAA-0001")
            .match_body(Matcher::PartialJson(json!({
                "certificationRequestInfo": {"subject": "AAAA-0001"},
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"endpointState": "ACTIVATED", "certificate": "cert-bytes"}"#)
            .create_async()
            .await;

        device.activate(&[]).await.unwrap();
        assert_eq!(device.state(), DeviceState::Activated);
        assert_eq!(device.certificate().as_deref(), Some("cert-bytes"));
        // the cached policy is only valid for one activation attempt
        assert!(device.activation_policy().is_none());

        let headers = device.authorization_headers().unwrap();
        assert_eq!(headers[1], ("X-EndpointId", "AAAA-0001".to_owned()));

        token_mock.assert_async().await;
        policy_mock.assert_async().await;
        activation_mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_activation_step_leaves_identity_state_untouched() {
        let mut server = Server::new_async().await;
        let device = device_for(&server);

        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(403)
            .with_body("bad secret")
            .create_async()
            .await;

        let err = device.request_activation_token().await.unwrap_err();
        assert!(matches!(err, ClientError::Status(StatusCode::FORBIDDEN, _)));
        assert!(device.authorization_headers().is_none());
        assert_eq!(device.state(), DeviceState::Registered);

        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn concurrent_token_requests_coalesce_into_one_fetch() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::UrlEncoded(
                "client_assertion_type".into(),
                JWT_ASSERTION_TYPE.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .expect(1)
            .create_async()
            .await;

        let device = device_for(&server);
        let (a, b) = tokio::join!(device.request_token(), device.request_token());
        a.unwrap();
        b.unwrap();

        assert_eq!(device.token_scope().as_deref(), Some(SCOPE_SESSION));
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_fetch_failure_is_shared_and_clears_the_marker() {
        let mut server = Server::new_async().await;
        let rejected = server
            .mock("POST", TOKEN_PATH)
            .with_status(400)
            .with_body("bad assertion")
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .expect(1)
            .create_async()
            .await;

        let device = device_for(&server);
        let (a, b) = tokio::join!(device.request_token(), device.request_token());
        assert!(a.is_err());
        assert!(b.is_err());
        assert!(device.token_scope().is_none());

        // the in-flight marker was cleared, a later call starts fresh
        device.request_token().await.unwrap();

        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn send_retries_exactly_once_after_401() {
        let mut server = Server::new_async().await;
        // one seed fetch plus exactly one 401-triggered refresh
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .expect(2)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", MESSAGES_PATH)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", MESSAGES_PATH)
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let device = device_for(&server);
        device.request_token().await.unwrap();

        device
            .send_data_messages("urn:x:data", json!({"a": 1}), None)
            .await
            .unwrap();

        token_mock.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn second_401_fails_without_a_third_refresh() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .expect(2)
            .create_async()
            .await;
        let rejected = server
            .mock("POST", MESSAGES_PATH)
            .with_status(401)
            .with_body("expired")
            .expect(2)
            .create_async()
            .await;

        let device = device_for(&server);
        device.request_token().await.unwrap();

        let err = device
            .send_data_messages("urn:x:data", json!({"a": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Status(StatusCode::UNAUTHORIZED, _)
        ));

        token_mock.assert_async().await;
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn data_batch_becomes_one_envelope_per_item() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .create_async()
            .await;
        let messages_mock = server
            .mock("POST", MESSAGES_PATH)
            .match_body(Matcher::PartialJson(json!([
                {"type": "DATA", "source": "AAAA-0001", "payload": {"format": "urn:x:data", "data": {"a": 1}}},
                {"type": "DATA", "source": "AAAA-0001", "payload": {"format": "urn:x:data", "data": {"a": 2}}},
            ])))
            .with_status(202)
            .create_async()
            .await;

        let device = device_for(&server);
        device
            .send_data_messages("urn:x:data", vec![json!({"a": 1}), json!({"a": 2})], None)
            .await
            .unwrap();

        token_mock.assert_async().await;
        messages_mock.assert_async().await;
    }

    #[tokio::test]
    async fn activation_scoped_token_forces_a_refresh_before_sending() {
        let mut server = Server::new_async().await;
        // activation grant, then the forced session grant
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("some-token"))
            .expect(2)
            .create_async()
            .await;
        let messages_mock = server
            .mock("POST", MESSAGES_PATH)
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let device = device_for(&server);
        device.request_activation_token().await.unwrap();
        assert_eq!(device.token_scope().as_deref(), Some(SCOPE_ACTIVATION));

        device
            .send_alerts(
                "urn:x:alert",
                "too hot",
                Severity::Critical,
                json!({"temperature": 80}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(device.token_scope().as_deref(), Some(SCOPE_SESSION));

        token_mock.assert_async().await;
        messages_mock.assert_async().await;
    }

    #[tokio::test]
    async fn indirect_enrollment_fills_defaults_and_returns_the_child() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("session-token"))
            .create_async()
            .await;
        let enroll_mock = server
            .mock("POST", "/iot/api/v2/activation/indirect/device")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({"manufacturer": "Contoso"})),
                Matcher::Regex("\"hardwareId\":\"hw-".to_owned()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"endpointId": "CHILD-0001", "endpointState": "ACTIVATED"}"#)
            .create_async()
            .await;

        let device = device_for(&server);
        let mut attributes = Map::new();
        attributes.insert("manufacturer".to_owned(), json!("Contoso"));

        let child = device.indirect_enroll(attributes).await.unwrap();
        assert_eq!(child["endpointId"], json!("CHILD-0001"));

        token_mock.assert_async().await;
        enroll_mock.assert_async().await;
    }

    #[tokio::test]
    async fn children_query_filters_by_owner_and_state() {
        let mut server = Server::new_async().await;
        let expected_query =
            json!({"directlyConnectedOwner": "AAAA-0001", "state": {"$ne": "DECOMMISSIONED"}});
        let list_mock = server
            .mock("GET", "/iot/api/v2/devices")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), expected_query.to_string()),
                Matcher::UrlEncoded("offset".into(), "0".into()),
                Matcher::UrlEncoded("limit".into(), "200".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items": [{"id": "CHILD-0001"}], "hasMore": false}"#)
            .create_async()
            .await;

        let device = device_for(&server);
        device.client().set_principal("iot", "welcome1");

        let children = device.children(None, None).await.unwrap();
        assert_eq!(children.items.len(), 1);

        list_mock.assert_async().await;
    }
}
