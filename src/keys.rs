//! Client signing keypair.
//!
//! Each dialer owns an RSA-2048 keypair. The public half is submitted to the
//! control plane when requesting an ephemeral certificate; the private half
//! backs the mutual-TLS handshake. Generating the default keypair is
//! expensive, so it happens lazily, at most once per process. Callers that
//! need deterministic behavior (notably tests) inject their own key.

use std::sync::{Arc, OnceLock};

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{Error, Result};

const KEY_BITS: usize = 2048;

static DEFAULT_KEYS: OnceLock<Result<Arc<ClientKeys>>> = OnceLock::new();

/// An RSA keypair in the two encodings the connector needs: SPKI PEM for the
/// control plane and PKCS#8 DER for rustls.
pub struct ClientKeys {
    public_key_pem: String,
    pkcs8_der: Vec<u8>,
}

impl ClientKeys {
    /// Generate a fresh RSA-2048 keypair.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| Error::config(format!("failed to generate RSA key: {e}"), "n/a"))?;
        ClientKeys::from_private_key(&key)
    }

    /// Build from an existing RSA private key.
    pub fn from_private_key(key: &RsaPrivateKey) -> Result<Self> {
        let public_key_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::config(format!("failed to encode public key: {e}"), "n/a"))?;
        let pkcs8_der = key
            .to_pkcs8_der()
            .map_err(|e| Error::config(format!("failed to encode private key: {e}"), "n/a"))?
            .as_bytes()
            .to_vec();
        Ok(ClientKeys {
            public_key_pem,
            pkcs8_der,
        })
    }

    /// The process-wide default keypair, generated on first use.
    pub(crate) fn default_keys() -> Result<Arc<ClientKeys>> {
        DEFAULT_KEYS
            .get_or_init(|| ClientKeys::generate().map(Arc::new))
            .clone()
    }

    /// SPKI PEM of the public key, as submitted to the control plane.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// PKCS#8 copy of the private key for rustls.
    pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.pkcs8_der.clone()))
    }
}

impl std::fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render key material.
        f.debug_struct("ClientKeys").finish_non_exhaustive()
    }
}
