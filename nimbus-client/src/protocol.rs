use serde_json::{Map, Value, json};

use nimbus_util::crypto::{KeyPair, hmac_sha256};
use nimbus_util::types::{EndpointId, SharedSecret};

use crate::error::ClientError;
use crate::message::epoch_millis;
use crate::models::ActivationPolicy;

/// Device capability URNs. Activation requests must carry
/// [`capabilities::DIRECT_ACTIVATION`] or the cloud silently rejects them.
pub mod capabilities {
    pub const DIRECT_ACTIVATION: &str = "urn:nimbus:iot:dcd:capability:direct_activation";
    pub const INDIRECT_ACTIVATION: &str = "urn:nimbus:iot:dcd:capability:indirect_activation";
    pub const DIAGNOSTICS: &str = "urn:nimbus:iot:dcd:capability:diagnostics";
    pub const MESSAGE_DISPATCHER: &str = "urn:nimbus:iot:dcd:capability:message_dispatcher";
}

/// Well-known device model URNs.
pub mod device_models {
    pub const DEFAULT: &str = "urn:nimbus:iot:device:multi_sensor";
    pub const TEMPERATURE_SENSOR: &str = "urn:nimbus:iot:device:temperature_sensor";
    pub const HUMIDITY_SENSOR: &str = "urn:nimbus:iot:device:humidity_sensor";
    pub const LOCATION_SENSOR: &str = "urn:nimbus:iot:device:location_sensor";
    pub const WEIGHT_SENSOR: &str = "urn:nimbus:iot:device:weight_sensor";
    pub const AMPERAGE_SENSOR: &str = "urn:nimbus:iot:device:amperage_sensor";
    pub const VOLTAGE_SENSOR: &str = "urn:nimbus:iot:device:voltage_sensor";
}

pub(crate) const SCOPE_ACTIVATION: &str = "nimbus/iot/activation";
pub(crate) const SCOPE_SESSION: &str = "";
pub(crate) const TOKEN_AUDIENCE: &str = "nimbus/iot/oauth2/token";
pub(crate) const JWT_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
pub(crate) const SECRET_HASH_ALGORITHM: &str = "HmacSHA256";

/// Protocol version strategy.
///
/// The two API generations differ in endpoint paths, in how the activation
/// digest is computed and in the mandatory attributes of indirect
/// enrollment. A client selects its variant once at construction; version
/// discovery may revise it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
            ProtocolVersion::V2 => "v2",
        }
    }

    pub(crate) fn api_root() -> &'static str {
        "/iot/api/"
    }

    // Token issuance never moved off the v1 path.
    pub(crate) fn token_path(self) -> &'static str {
        "/iot/api/v1/oauth2/token"
    }

    pub(crate) fn policy_path(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "/iot/api/v1/activation/policy",
            ProtocolVersion::V2 => "/iot/api/v2/activation/policy",
        }
    }

    pub(crate) fn activation_path(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "/iot/api/v1/activation/direct",
            ProtocolVersion::V2 => "/iot/api/v2/activation/direct",
        }
    }

    pub(crate) fn indirect_activation_path(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "/iot/api/v1/activation/indirect/device",
            ProtocolVersion::V2 => "/iot/api/v2/activation/indirect/device",
        }
    }

    pub(crate) fn messages_path(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "/iot/api/v1/messages",
            ProtocolVersion::V2 => "/iot/api/v2/messages",
        }
    }

    /// Path of the device/endpoint collection.
    pub(crate) fn directory_path(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "/iot/api/v1/endpoints",
            ProtocolVersion::V2 => "/iot/api/v2/devices",
        }
    }

    pub(crate) fn apps_path(self) -> &'static str {
        "/iot/api/v2/apps"
    }

    pub(crate) fn device_models_path(self) -> &'static str {
        "/iot/api/v2/deviceModels"
    }

    /// The HMAC-SHA256 digest signed into activation requests. V1 includes
    /// the shared secret in the digested data, later versions digest the
    /// client id alone. Both variants are kept deliberately.
    pub(crate) fn activation_digest(self, id: &EndpointId, secret: &SharedSecret) -> Vec<u8> {
        match self {
            ProtocolVersion::V1 => {
                hmac_sha256(secret.as_bytes(), format!("{id}\n{secret}").as_bytes())
            }
            ProtocolVersion::V2 => hmac_sha256(secret.as_bytes(), id.as_bytes()),
        }
    }

    /// Builds the signed certificate request submitted for direct
    /// activation.
    ///
    /// The signed buffer is the header line
    /// `<id>\n<keyType>\n<format>\nHmacSHA256\n` followed by the raw
    /// activation digest and the DER bytes of the device public key. The
    /// `direct_activation` capability is force-appended when absent.
    pub(crate) fn build_activation_payload(
        self,
        id: &EndpointId,
        secret: &SharedSecret,
        policy: &ActivationPolicy,
        keys: &KeyPair,
        device_models: &[&str],
    ) -> Result<Value, ClientError> {
        let digest = self.activation_digest(id, secret);

        let header = format!(
            "{id}\n{}\n{}\n{SECRET_HASH_ALGORITHM}\n",
            policy.key_type, policy.format
        );
        let mut buffer = header.into_bytes();
        buffer.extend_from_slice(&digest);
        buffer.extend_from_slice(&keys.public_key_der()?);

        // policy.hash_algorithm is SHA256withRSA, the same scheme used here
        let signature = keys.sign_sha256_base64(&buffer);

        let mut models: Vec<String> = if device_models.is_empty() {
            vec![device_models::DEFAULT.to_owned()]
        } else {
            device_models.iter().map(|m| (*m).to_owned()).collect()
        };
        if !models.iter().any(|m| m == capabilities::DIRECT_ACTIVATION) {
            models.push(capabilities::DIRECT_ACTIVATION.to_owned());
        }

        Ok(json!({
            "certificationRequestInfo": {
                "subject": id.as_str(),
                "subjectPublicKeyInfo": {
                    "algorithm": &policy.key_type,
                    "publicKey": keys.public_key_base64()?,
                    "format": &policy.format,
                    "secretHashAlgorithm": SECRET_HASH_ALGORITHM,
                },
                "attributes": null,
            },
            "signatureAlgorithm": &policy.hash_algorithm,
            "signature": signature,
            "deviceModels": models,
        }))
    }

    /// Fills in the attributes the cloud requires for indirect enrollment
    /// when the caller did not provide them.
    pub(crate) fn enrollment_attributes(self, attributes: Map<String, Value>) -> Map<String, Value> {
        let mut attrs = attributes;
        match self {
            ProtocolVersion::V1 => {
                let time = epoch_millis();
                for field in ["manufacturer", "productClass", "serialNumber"] {
                    attrs
                        .entry(field)
                        .or_insert_with(|| Value::String(format!("indirect-{field}-{time}")));
                }
            }
            ProtocolVersion::V2 => {
                attrs.entry("hardwareId").or_insert_with(|| {
                    Value::String(format!("hw-{}", uuid::Uuid::new_v4()))
                });
                attrs
                    .entry("deviceModels")
                    .or_insert_with(|| json!([device_models::DEFAULT]));
            }
        }
        attrs
    }

    /// Query selecting a gateway's active children, keyed by
    /// `directlyConnectedOwner`.
    pub(crate) fn children_query(self, owner: &EndpointId) -> Value {
        match self {
            ProtocolVersion::V1 => json!({
                "type": "AND",
                "children": [
                    {"type": "EQUAL", "property": "state", "value": "ACTIVATED"},
                    {"type": "EQUAL", "property": "directlyConnectedOwner", "value": owner.as_str()},
                ],
            }),
            ProtocolVersion::V2 => json!({
                "directlyConnectedOwner": owner.as_str(),
                "state": {"$ne": "DECOMMISSIONED"},
            }),
        }
    }
}

impl TryFrom<&str> for ProtocolVersion {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "v1" => Ok(ProtocolVersion::V1),
            "v2" => Ok(ProtocolVersion::V2),
            other => Err(ClientError::UnsupportedVersion(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_keys;

    fn policy() -> ActivationPolicy {
        ActivationPolicy {
            format: "X.509".to_owned(),
            key_type: "RSA".to_owned(),
            key_size: 2048,
            hash_algorithm: "SHA256withRSA".to_owned(),
        }
    }

    #[test]
    fn digest_variants_differ() {
        let id = EndpointId::from("AAAA-0001");
        let secret = SharedSecret::from("hush");

        let v1 = ProtocolVersion::V1.activation_digest(&id, &secret);
        let v2 = ProtocolVersion::V2.activation_digest(&id, &secret);
        assert_ne!(v1, v2);
        // V2 digests the id alone
        assert_eq!(v2, hmac_sha256(b"hush", b"AAAA-0001"));
    }

    #[test]
    fn activation_payload_subject_is_the_client_id() {
        let id = EndpointId::from("AAAA-0001");
        let secret = SharedSecret::from("hush");

        let payload = ProtocolVersion::V2
            .build_activation_payload(&id, &secret, &policy(), test_keys(), &["urn:x:thing"])
            .unwrap();

        assert_eq!(
            payload["certificationRequestInfo"]["subject"],
            json!("AAAA-0001")
        );
        assert_eq!(payload["signatureAlgorithm"], json!("SHA256withRSA"));
    }

    #[test]
    fn direct_activation_capability_is_force_appended() {
        let id = EndpointId::from("AAAA-0001");
        let secret = SharedSecret::from("hush");

        for models in [&[][..], &["urn:x:thing"][..]] {
            let payload = ProtocolVersion::V2
                .build_activation_payload(&id, &secret, &policy(), test_keys(), models)
                .unwrap();
            let models = payload["deviceModels"].as_array().unwrap();
            assert!(models.contains(&json!(capabilities::DIRECT_ACTIVATION)));
        }

        // ... but not twice if the caller already included it
        let payload = ProtocolVersion::V2
            .build_activation_payload(
                &id,
                &secret,
                &policy(),
                test_keys(),
                &[capabilities::DIRECT_ACTIVATION],
            )
            .unwrap();
        assert_eq!(payload["deviceModels"], json!([capabilities::DIRECT_ACTIVATION]));
    }

    #[test]
    fn activation_signature_verifies_over_the_documented_buffer() {
        let id = EndpointId::from("AAAA-0001");
        let secret = SharedSecret::from("hush");
        let keys = test_keys();

        let payload = ProtocolVersion::V2
            .build_activation_payload(&id, &secret, &policy(), keys, &[])
            .unwrap();

        let mut buffer = b"AAAA-0001\nRSA\nX.509\nHmacSHA256\n".to_vec();
        buffer.extend_from_slice(&ProtocolVersion::V2.activation_digest(&id, &secret));
        buffer.extend_from_slice(&keys.public_key_der().unwrap());

        use base64::Engine as _;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(payload["signature"].as_str().unwrap())
            .unwrap();
        assert!(keys.verify_sha256(&buffer, &signature));
    }

    #[test]
    fn v1_enrollment_fills_mandatory_attributes() {
        let attrs = ProtocolVersion::V1.enrollment_attributes(Map::new());
        for field in ["manufacturer", "productClass", "serialNumber"] {
            assert!(!attrs[field].as_str().unwrap().is_empty());
        }
    }

    #[test]
    fn v2_enrollment_fills_hardware_id_and_models() {
        let attrs = ProtocolVersion::V2.enrollment_attributes(Map::new());
        assert!(attrs["hardwareId"].as_str().unwrap().starts_with("hw-"));
        assert_eq!(attrs["deviceModels"], json!([device_models::DEFAULT]));
    }

    #[test]
    fn enrollment_defaults_do_not_override_given_attributes() {
        let mut given = Map::new();
        given.insert("manufacturer".to_owned(), json!("Contoso"));
        let attrs = ProtocolVersion::V1.enrollment_attributes(given);
        assert_eq!(attrs["manufacturer"], json!("Contoso"));
    }
}
