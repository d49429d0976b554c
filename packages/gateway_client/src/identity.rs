//! Device-identity seam.
//!
//! The engine never touches key material directly; it needs a stable
//! fingerprint, the encoded public key, a signing function, and somewhere to
//! park the gateway-issued device token. `device_identity::DeviceKeypair`
//! satisfies this out of the box; embedders with platform keystores implement
//! the trait themselves.

use device_identity::DeviceKeypair;

pub trait DeviceIdentity: Send + Sync {
    /// Stable device id, constant across reconnects.
    fn fingerprint(&self) -> String;

    /// URL-safe base64 public key as sent in the `device` block.
    fn public_key_base64(&self) -> String;

    /// Sign `message`, returning the URL-safe base64 detached signature.
    fn sign(&self, message: &[u8]) -> String;

    /// The device token issued after a previous approval, if any.
    fn device_token(&self) -> Option<String>;

    /// Persist a (possibly rotated) device token.
    fn store_device_token(&self, token: String);
}

impl DeviceIdentity for DeviceKeypair {
    fn fingerprint(&self) -> String {
        DeviceKeypair::fingerprint(self)
    }

    fn public_key_base64(&self) -> String {
        self.public_key().to_string()
    }

    fn sign(&self, message: &[u8]) -> String {
        DeviceKeypair::sign(self, message).to_string()
    }

    fn device_token(&self) -> Option<String> {
        DeviceKeypair::device_token(self)
    }

    fn store_device_token(&self, token: String) {
        DeviceKeypair::store_device_token(self, token)
    }
}
