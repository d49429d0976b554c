//! URL-safe base64 (unpadded) helpers shared across the crate.

use data_encoding::DecodeError;

/// URL-safe base64, unpadded.
pub fn base64_encode(bytes: &[u8]) -> String {
    data_encoding::BASE64URL_NOPAD.encode(bytes)
}

/// Decode URL-safe base64, unpadded.
pub fn base64_decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    data_encoding::BASE64URL_NOPAD.decode(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let data = b"gateway client";
        let encoded = base64_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(base64_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn base64_url_safe_alphabet() {
        // 0xfb 0xff encodes to characters outside the standard alphabet
        let encoded = base64_encode(&[0xfb, 0xff, 0xfe]);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
    }

    #[test]
    fn base64_decode_rejects_garbage() {
        assert!(base64_decode("not base64!!").is_err());
    }
}
