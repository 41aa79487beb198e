use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Computes an HMAC-SHA256 digest of `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Same as [`hmac_sha256`] but base64-encodes the digest, which is the
/// encoding the cloud expects in authentication grants.
pub fn hmac_sha256_base64(key: &[u8], data: &[u8]) -> String {
    BASE64.encode(hmac_sha256(key, data))
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("RSA key generation failed: {0}")]
    Generate(#[from] rsa::Error),

    #[error("private key PKCS#8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("failed to encode public key: {0}")]
    Encode(#[from] rsa::pkcs8::spki::Error),
}

/// The device-side RSA key pair used for all signing operations.
///
/// Loaded (or generated) once per process and shared across device
/// identities; the cloud only ever sees the public half.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generates a fresh key pair. Mostly useful for demos and tests;
    /// production devices load a provisioned key with
    /// [`KeyPair::from_private_key_pem`].
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Loads a key pair from a PKCS#8 PEM-encoded private key.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Signs `data` with RSA-SHA256 (PKCS#1 v1.5), the signature scheme
    /// the activation protocol calls `SHA256withRSA`.
    pub fn sign_sha256(&self, data: &[u8]) -> Vec<u8> {
        let key = SigningKey::<Sha256>::new(self.private.clone());
        key.sign(data).to_vec()
    }

    /// Signs `data` and base64-encodes the signature.
    pub fn sign_sha256_base64(&self, data: &[u8]) -> String {
        BASE64.encode(self.sign_sha256(data))
    }

    /// Verifies an RSA-SHA256 signature produced by [`KeyPair::sign_sha256`].
    pub fn verify_sha256(&self, data: &[u8], signature: &[u8]) -> bool {
        let key = VerifyingKey::<Sha256>::new(self.public.clone());
        Signature::try_from(signature)
            .map(|signature| key.verify(data, &signature).is_ok())
            .unwrap_or(false)
    }

    /// The public key as DER-encoded SubjectPublicKeyInfo bytes. These are
    /// the raw bytes included in the signed activation payload.
    pub fn public_key_der(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.public.to_public_key_der()?.as_bytes().to_vec())
    }

    /// The public key as a base64 string (DER, without PEM armor), which is
    /// how the key travels inside activation request bodies.
    pub fn public_key_base64(&self) -> Result<String, KeyError> {
        Ok(BASE64.encode(self.public_key_der()?))
    }

    /// The private key as PKCS#8 PEM, for persisting a generated key.
    pub fn private_key_pem(&self) -> Result<String, KeyError> {
        Ok(self.private.to_pkcs8_pem(LineEnding::LF)?.to_string())
    }
}
