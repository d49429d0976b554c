//! Error types for identity material handling.

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid signature")]
    InvalidSignature,
}
