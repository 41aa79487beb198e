/*
Client library for the nimbus device cloud.

This crate is home to everything a device (or an application acting on
devices) needs to talk to the cloud's REST surface: provisioning and
directory operations, the certificate-based activation handshake, session
token management and message submission.

The transport is a plain `reqwest` client; the library never manages
connections or retries beyond the documented one-shot retry after a 401.
*/

mod client;
mod config;
mod credentials;
mod device;
mod error;
mod message;
mod models;
mod protocol;

pub use client::IotClient;
pub use config::ClientConfig;
pub use credentials::EnterpriseApplication;
pub use device::Device;
pub use error::{ClientError, TokenError};
pub use message::{Data, Message, MessageType, Priority, Reliability, Severity};
pub use models::{
    ActivationPolicy, ActivationResponse, DeviceAttributes, DeviceRecord, DeviceState, ListPage,
    TokenResponse,
};
pub use protocol::{ProtocolVersion, capabilities, device_models};

pub use nimbus_util::crypto::KeyPair;
pub use nimbus_util::http::Uri;
pub use nimbus_util::types::{EndpointId, SharedSecret};
