use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

/// Identifier assigned to a device or enterprise application by the cloud.
///
/// Before activation the cloud refers to it as an activation id, afterwards
/// as an endpoint id; the value itself never changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(String);

impl Deref for EndpointId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<EndpointId> for String {
    fn from(value: EndpointId) -> Self {
        value.0
    }
}

/// Pre-shared secret used for HMAC-based authentication grants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Deref for SharedSecret {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SharedSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SharedSecret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<SharedSecret> for String {
    fn from(value: SharedSecret) -> Self {
        value.0
    }
}
