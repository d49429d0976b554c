//! Ed25519 device identity primitives for the gateway client.
//!
//! A device proves possession of a persistent Ed25519 keypair during the
//! gateway's challenge-response handshake. This crate holds the key types,
//! the URL-safe base64 encoding used on the wire, the SHA-256 public-key
//! fingerprint that serves as the stable device id, and the keypair wrapper
//! that also remembers the gateway-issued device token.

pub mod device;
pub mod encoding;
pub mod error;
pub mod keys;

pub use device::DeviceKeypair;
pub use error::IdentityError;
pub use keys::{PublicKey, Signature, SigningKey, verify};
