use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex};
use tracing::debug;

use nimbus_util::crypto::hmac_sha256_base64;
use nimbus_util::types::{EndpointId, SharedSecret};

use crate::client::IotClient;
use crate::error::{ClientError, TokenError};
use crate::models::TokenResponse;
use crate::protocol::SCOPE_SESSION;

pub(crate) type SharedTokenFetch = Shared<BoxFuture<'static, Result<TokenResponse, TokenError>>>;

/// How the client authenticates directory requests: a fixed basic-auth
/// principal, or a bearer token delegated to an enterprise application.
#[derive(Clone)]
pub(crate) enum CredentialSource {
    Principal { username: String, password: String },
    Enterprise(EnterpriseApplication),
}

/// An enterprise application identity that trades its shared secret for a
/// bearer token and attaches it to every request issued through the client.
///
/// The token is fetched lazily, cached for subsequent requests and
/// invalidated on 401. Concurrent requests that find no cached token
/// coalesce into a single fetch.
#[derive(Clone)]
pub struct EnterpriseApplication {
    inner: Arc<EaInner>,
}

struct EaInner {
    id: EndpointId,
    shared_secret: SharedSecret,
    token: Mutex<Option<TokenResponse>>,
    pending: Mutex<Option<SharedTokenFetch>>,
}

impl EnterpriseApplication {
    pub fn new(id: impl Into<EndpointId>, shared_secret: impl Into<SharedSecret>) -> Self {
        Self {
            inner: Arc::new(EaInner {
                id: id.into(),
                shared_secret: shared_secret.into(),
                token: Mutex::new(None),
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.inner.id
    }

    pub fn has_credentials(&self) -> bool {
        self.inner.token.lock().expect("lock poisoned").is_some()
    }

    pub fn clear_credentials(&self) {
        self.inner.token.lock().expect("lock poisoned").take();
    }

    /// Header pairs authorizing a request on behalf of this application,
    /// fetching a token first if none is cached.
    pub(crate) async fn authorization_headers(
        &self,
        client: &IotClient,
    ) -> Result<[(&'static str, String); 2], ClientError> {
        let token = self.token(client).await?;
        Ok([
            (
                "Authorization",
                format!("{} {}", token.token_type, token.access_token),
            ),
            ("X-EndpointId", self.inner.id.to_string()),
        ])
    }

    async fn token(&self, client: &IotClient) -> Result<TokenResponse, TokenError> {
        if let Some(token) = self.inner.token.lock().expect("lock poisoned").clone() {
            return Ok(token);
        }

        let fetch = {
            let mut pending = self.inner.pending.lock().expect("lock poisoned");
            match pending.as_ref() {
                Some(fetch) => fetch.clone(),
                None => {
                    let ea = self.clone();
                    let client = client.clone();
                    let fetch = async move {
                        let result = ea.fetch_token(&client).await;
                        if let Ok(token) = &result {
                            *ea.inner.token.lock().expect("lock poisoned") = Some(token.clone());
                        }
                        // clear the in-flight marker on success and failure alike
                        ea.inner.pending.lock().expect("lock poisoned").take();
                        result.map_err(|e| TokenError(Arc::new(e)))
                    }
                    .boxed()
                    .shared();
                    *pending = Some(fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    async fn fetch_token(&self, client: &IotClient) -> Result<TokenResponse, ClientError> {
        let id = &self.inner.id;
        let secret = &self.inner.shared_secret;
        let hash = hmac_sha256_base64(secret.as_bytes(), format!("{id}\n{secret}").as_bytes());

        debug!(application = %id, "requesting enterprise token");
        let form = [
            ("grant_type", "client_credentials".to_owned()),
            ("client_id", id.to_string()),
            ("scope", SCOPE_SESSION.to_owned()),
            ("client_secret", format!("HmacSHA256:{hash}")),
        ];

        let url = client.url(client.version().token_path(), None)?;
        let response = client
            .http()
            .post(url)
            .timeout(client.request_timeout())
            .form(&form)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ClientError::from_response(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::test_support::test_keys;
    use mockito::Server;

    fn client_for(server: &Server) -> IotClient {
        let config = ClientConfig::new(server.url().parse().unwrap());
        IotClient::new(config, test_keys().clone()).unwrap()
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_token_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/iot/api/v1/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type": "Bearer", "access_token": "tok-1"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let ea = EnterpriseApplication::new("EA-1", "secret");

        let (a, b) = tokio::join!(
            ea.authorization_headers(&client),
            ea.authorization_headers(&client)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(ea.has_credentials());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_cleared() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/iot/api/v1/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type": "Bearer", "access_token": "tok-1"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        let ea = EnterpriseApplication::new("EA-1", "secret");

        ea.authorization_headers(&client).await.unwrap();
        ea.authorization_headers(&client).await.unwrap();

        ea.clear_credentials();
        assert!(!ea.has_credentials());
        ea.authorization_headers(&client).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_fetch_is_shared_and_not_cached() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/iot/api/v1/oauth2/token")
            .with_status(400)
            .with_body("bad grant")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let ea = EnterpriseApplication::new("EA-1", "secret");

        let (a, b) = tokio::join!(
            ea.authorization_headers(&client),
            ea.authorization_headers(&client)
        );
        assert!(a.is_err());
        assert!(b.is_err());
        assert!(!ea.has_credentials());

        mock.assert_async().await;
    }
}
