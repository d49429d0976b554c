//! Challenge-response auth handshake.
//!
//! The server opens with a `connect.challenge` event carrying a nonce. The
//! engine answers with a `connect` request whose `device` block proves
//! possession of the device key: a detached Ed25519 signature over a
//! canonical pipe-delimited payload ending in the bearer token and the nonce.

use chrono::Utc;

use crate::config::ClientConfig;
use crate::identity::DeviceIdentity;
use crate::protocol::{AuthBlock, ClientInfo, ConnectParams, DeviceBlock, ErrorShape};

/// Leading tag of the canonical signing payload. Changing it invalidates
/// every deployed verifier.
pub const SIGNING_TAG: &str = "v1";

/// Canonical payload the device signs:
/// `tag|fingerprint|clientId|mode|role|scopes,csv|signedAtMs|token|nonce`.
pub fn signing_payload(
    fingerprint: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: u64,
    token: &str,
    nonce: &str,
) -> String {
    format!(
        "{SIGNING_TAG}|{fingerprint}|{client_id}|{client_mode}|{role}|{}|{signed_at_ms}|{token}|{nonce}",
        scopes.join(",")
    )
}

/// Build the full `connect` request params for a challenge nonce.
pub fn build_connect_params(
    config: &ClientConfig,
    identity: &dyn DeviceIdentity,
    nonce: &str,
) -> ConnectParams {
    let signed_at = Utc::now().timestamp_millis().max(0) as u64;
    let token = config.token.clone().unwrap_or_default();
    let fingerprint = identity.fingerprint();

    let payload = signing_payload(
        &fingerprint,
        &config.client_id,
        &config.client_mode,
        &config.role,
        &config.scopes,
        signed_at,
        &token,
        nonce,
    );
    let signature = identity.sign(payload.as_bytes());

    ConnectParams {
        min_protocol: config.min_protocol,
        max_protocol: config.max_protocol,
        client: ClientInfo {
            id: config.client_id.clone(),
            version: config.client_version.clone(),
            platform: config.client_platform.clone(),
            mode: config.client_mode.clone(),
        },
        role: config.role.clone(),
        scopes: config.scopes.clone(),
        auth: AuthBlock {
            token: config.token.clone(),
            device_token: identity.device_token(),
        },
        locale: config.locale.clone(),
        user_agent: config.user_agent.clone(),
        device: Some(DeviceBlock {
            id: fingerprint,
            public_key: identity.public_key_base64(),
            signature,
            signed_at,
            nonce: nonce.to_string(),
        }),
    }
}

/// How a failed handshake response should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Operator approval pending; keep retrying on the usual cadence.
    PairingRequired(String),
    /// Unrecoverable credential error; stop retrying.
    Fatal(String),
}

/// Classify an `ok=false` response to the `connect` request.
pub fn classify_failure(error: Option<&ErrorShape>) -> AuthFailure {
    let shape = error.cloned().unwrap_or_default();
    let code_matches = shape.code.as_deref().is_some_and(|c| {
        c.eq_ignore_ascii_case("pairing_required") || c.eq_ignore_ascii_case("not_paired")
    });
    let message_matches = shape
        .message
        .as_deref()
        .is_some_and(|m| m.to_ascii_lowercase().contains("pairing required"));

    if code_matches || message_matches {
        AuthFailure::PairingRequired(shape.display())
    } else {
        AuthFailure::Fatal(shape.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_identity::{DeviceKeypair, PublicKey, Signature, verify};

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new("gw.local", 9100);
        config.token = Some("abc".to_string());
        config.client_id = "panel".to_string();
        config.client_mode = "ui".to_string();
        config.role = "operator".to_string();
        config.scopes = vec!["chat".to_string(), "sessions".to_string()];
        config
    }

    #[test]
    fn signing_payload_layout() {
        let payload = signing_payload(
            "fp", "panel", "ui", "operator",
            &["chat".to_string(), "sessions".to_string()],
            1234, "abc", "n1",
        );
        assert_eq!(payload, "v1|fp|panel|ui|operator|chat,sessions|1234|abc|n1");
        assert!(payload.ends_with("|abc|n1"));
    }

    #[test]
    fn connect_params_carry_verifiable_signature() {
        let device = DeviceKeypair::from_seed([21u8; 32], None);
        let config = test_config();
        let params = build_connect_params(&config, &device, "n1");

        let block = params.device.expect("device block");
        assert_eq!(block.nonce, "n1");
        assert_eq!(block.id, device.fingerprint());

        let payload = signing_payload(
            &block.id,
            &config.client_id,
            &config.client_mode,
            &config.role,
            &config.scopes,
            block.signed_at,
            "abc",
            "n1",
        );
        let pk = PublicKey::from_base64(&block.public_key).unwrap();
        let sig = Signature::from_base64(&block.signature).unwrap();
        assert!(verify(&pk, payload.as_bytes(), &sig).is_ok());
    }

    #[test]
    fn connect_params_include_stored_device_token() {
        let device = DeviceKeypair::from_seed([21u8; 32], Some("issued".to_string()));
        let params = build_connect_params(&test_config(), &device, "n1");
        assert_eq!(params.auth.device_token.as_deref(), Some("issued"));
        assert_eq!(params.auth.token.as_deref(), Some("abc"));
    }

    #[test]
    fn classify_by_code() {
        let shape = ErrorShape {
            code: Some("pairing_required".to_string()),
            message: None,
        };
        assert!(matches!(
            classify_failure(Some(&shape)),
            AuthFailure::PairingRequired(_)
        ));

        let shape = ErrorShape {
            code: Some("NOT_PAIRED".to_string()),
            message: None,
        };
        assert!(matches!(
            classify_failure(Some(&shape)),
            AuthFailure::PairingRequired(_)
        ));
    }

    #[test]
    fn classify_by_message_phrase() {
        let shape = ErrorShape {
            code: None,
            message: Some("Pairing required: approve this device".to_string()),
        };
        assert!(matches!(
            classify_failure(Some(&shape)),
            AuthFailure::PairingRequired(_)
        ));
    }

    #[test]
    fn other_failures_are_fatal() {
        let shape = ErrorShape {
            code: Some("unauthorized".to_string()),
            message: Some("gateway token mismatch".to_string()),
        };
        assert!(matches!(classify_failure(Some(&shape)), AuthFailure::Fatal(_)));
        assert!(matches!(classify_failure(None), AuthFailure::Fatal(_)));
    }
}
