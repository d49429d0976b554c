//! The persistent device keypair and its gateway-issued token.

use std::sync::Mutex;

use crate::keys::{PublicKey, Signature, SigningKey};

/// A device's persistent Ed25519 keypair plus the opaque device token the
/// gateway issues once the device has been approved.
///
/// Secure storage of the seed is the embedder's job: export it with
/// [`DeviceKeypair::seed`] and restore with [`DeviceKeypair::from_seed`].
/// The token is mutable because the gateway may rotate it on any successful
/// handshake.
pub struct DeviceKeypair {
    signing: SigningKey,
    device_token: Mutex<Option<String>>,
}

impl DeviceKeypair {
    /// Generate a fresh keypair with no device token.
    pub fn generate<R: rand::CryptoRng + rand::RngCore>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
            device_token: Mutex::new(None),
        }
    }

    /// Restore a keypair from a stored 32-byte seed and optional token.
    pub fn from_seed(seed: [u8; 32], device_token: Option<String>) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
            device_token: Mutex::new(device_token),
        }
    }

    /// Raw seed for persistent storage.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing.public_key()
    }

    /// Stable device id (SHA-256 hex of the public key).
    pub fn fingerprint(&self) -> String {
        self.signing.public_key().fingerprint()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// The last token the gateway issued, if any.
    pub fn device_token(&self) -> Option<String> {
        self.device_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the stored device token.
    pub fn store_device_token(&self, token: String) {
        *self
            .device_token
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token);
    }
}

impl std::fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field("fingerprint", &self.fingerprint())
            .field("has_token", &self.device_token().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::verify;

    #[test]
    fn from_seed_restores_identity() {
        let a = DeviceKeypair::from_seed([3u8; 32], None);
        let b = DeviceKeypair::from_seed(a.seed(), None);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn signatures_verify_against_public_key() {
        let device = DeviceKeypair::from_seed([5u8; 32], None);
        let sig = device.sign(b"v1|payload");
        assert!(verify(&device.public_key(), b"v1|payload", &sig).is_ok());
    }

    #[test]
    fn token_store_and_replace() {
        let device = DeviceKeypair::from_seed([5u8; 32], Some("old".into()));
        assert_eq!(device.device_token().as_deref(), Some("old"));
        device.store_device_token("new".into());
        assert_eq!(device.device_token().as_deref(), Some("new"));
    }
}
