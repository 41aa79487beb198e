use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

use nimbus_util::crypto::KeyError;
use nimbus_util::http::InvalidUriError;

/// Errors surfaced by client and device operations.
///
/// Transport failures are propagated verbatim; unexpected status codes carry
/// the raw response body. A 401 is recovered locally exactly once per call
/// before it shows up here as a [`ClientError::Status`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("invalid request URI: {0}")]
    Uri(#[from] InvalidUriError),

    #[error("request encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("no credentials configured, call set_principal() or set_enterprise() first")]
    NoCredentials,

    #[error("unsupported API version: {0}")]
    UnsupportedVersion(String),

    #[error("activation policy not available")]
    MissingPolicy,

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Status(StatusCode::UNAUTHORIZED, _))
    }

    /// Turns a non-success response into an error carrying the raw body.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ClientError::Status(status, body)
    }
}

/// Error from a token fetch. Cloneable so that every caller coalesced into a
/// single-flight fetch can observe the same failure.
#[derive(Debug, Clone, Error)]
#[error(transparent)]
pub struct TokenError(pub Arc<ClientError>);
