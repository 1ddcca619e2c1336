//! Gateway connection authentication.
//!
//! A connecting client presents one of: nothing (loopback bypass, when the
//! configured mode allows it), a shared token, a password, or a device
//! identity (an ed25519 public key plus a detached signature over the
//! challenge nonce). Credential comparisons are constant-time.

use std::net::IpAddr;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use valet_domain::config::GatewayAuthSection;

/// Challenge nonces older than this are rejected for device auth.
const NONCE_MAX_AGE_MINUTES: i64 = 5;

/// How the connection ended up authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    LocalDirect,
    Token,
    Password,
    DeviceIdentity,
}

#[derive(Debug)]
pub struct AuthOutcome {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
}

impl AuthOutcome {
    fn ok(method: AuthMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason.into()),
        }
    }
}

/// Constant-time string comparison via SHA-256 digests. Hashing normalizes
/// lengths so `ct_eq` always compares 32 bytes.
fn credential_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

pub fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}

/// Device identity presented in the connect frame.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub id: String,
    pub public_key: String,
    pub signature: String,
}

impl DeviceIdentity {
    pub fn from_params(value: &Value) -> Option<Self> {
        Some(Self {
            id: value.get("id")?.as_str()?.to_owned(),
            public_key: value.get("publicKey")?.as_str()?.to_owned(),
            signature: value.get("signature")?.as_str()?.to_owned(),
        })
    }
}

/// Verify a device's detached signature over the challenge nonce and check
/// the nonce age window.
pub fn verify_device_identity(
    device: &DeviceIdentity,
    nonce: &str,
    challenge_sent_at: DateTime<Utc>,
) -> AuthOutcome {
    if Utc::now() - challenge_sent_at > Duration::minutes(NONCE_MAX_AGE_MINUTES) {
        return AuthOutcome::fail("challenge nonce expired");
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let key_bytes = match engine.decode(&device.public_key) {
        Ok(bytes) => bytes,
        Err(_) => return AuthOutcome::fail("device public key is not valid base64"),
    };
    let key_bytes: [u8; 32] = match key_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return AuthOutcome::fail("device public key must be 32 bytes"),
    };
    let key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(_) => return AuthOutcome::fail("device public key is not a valid ed25519 key"),
    };

    let sig_bytes = match engine.decode(&device.signature) {
        Ok(bytes) => bytes,
        Err(_) => return AuthOutcome::fail("device signature is not valid base64"),
    };
    let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return AuthOutcome::fail("device signature must be 64 bytes"),
    };
    let signature = Signature::from_bytes(&sig_bytes);

    match key.verify(nonce.as_bytes(), &signature) {
        Ok(()) => AuthOutcome::ok(AuthMethod::DeviceIdentity),
        Err(_) => AuthOutcome::fail("device signature does not verify against the nonce"),
    }
}

/// Authorize a connect attempt.
///
/// Loopback clients are admitted without a credential when the auth mode is
/// "none" or no credential is configured. Otherwise the frame must carry a
/// matching token or password, or a verifiable device identity.
pub fn authorize_connect(
    auth: &GatewayAuthSection,
    client_ip: Option<IpAddr>,
    request_token: Option<&str>,
    request_password: Option<&str>,
    device: Option<&DeviceIdentity>,
    nonce: &str,
    challenge_sent_at: DateTime<Utc>,
) -> AuthOutcome {
    let credential_configured = match auth.mode.as_str() {
        "token" => auth.token.is_some(),
        "password" => auth.password.is_some(),
        _ => false,
    };

    if client_ip.is_some_and(is_loopback) && !credential_configured {
        return AuthOutcome::ok(AuthMethod::LocalDirect);
    }

    match auth.mode.as_str() {
        "token" => {
            if let (Some(expected), Some(provided)) = (auth.token.as_deref(), request_token) {
                if credential_eq(expected, provided) {
                    return AuthOutcome::ok(AuthMethod::Token);
                }
            }
        }
        "password" => {
            if let (Some(expected), Some(provided)) =
                (auth.password.as_deref(), request_password)
            {
                if credential_eq(expected, provided) {
                    return AuthOutcome::ok(AuthMethod::Password);
                }
            }
        }
        "none" => {
            // Non-loopback with mode "none": only device identity admits.
        }
        other => {
            return AuthOutcome::fail(format!("unknown auth mode: {other}"));
        }
    }

    if let Some(device) = device {
        return verify_device_identity(device, nonce, challenge_sent_at);
    }

    AuthOutcome::fail("authentication failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn token_auth(token: &str) -> GatewayAuthSection {
        GatewayAuthSection {
            mode: "token".into(),
            token: Some(token.into()),
            password: None,
        }
    }

    fn loopback() -> Option<IpAddr> {
        Some("127.0.0.1".parse().unwrap())
    }

    fn remote() -> Option<IpAddr> {
        Some("10.1.2.3".parse().unwrap())
    }

    #[test]
    fn loopback_bypasses_when_nothing_configured() {
        let auth = GatewayAuthSection::default();
        let outcome =
            authorize_connect(&auth, loopback(), None, None, None, "n", Utc::now());
        assert!(outcome.ok);
        assert_eq!(outcome.method, Some(AuthMethod::LocalDirect));
    }

    #[test]
    fn loopback_still_requires_configured_token() {
        let auth = token_auth("secret");
        let outcome =
            authorize_connect(&auth, loopback(), None, None, None, "n", Utc::now());
        assert!(!outcome.ok);

        let outcome =
            authorize_connect(&auth, loopback(), Some("secret"), None, None, "n", Utc::now());
        assert!(outcome.ok);
        assert_eq!(outcome.method, Some(AuthMethod::Token));
    }

    #[test]
    fn wrong_token_fails() {
        let auth = token_auth("secret");
        let outcome =
            authorize_connect(&auth, remote(), Some("nope"), None, None, "n", Utc::now());
        assert!(!outcome.ok);
    }

    #[test]
    fn password_mode_matches() {
        let auth = GatewayAuthSection {
            mode: "password".into(),
            token: None,
            password: Some("hunter2".into()),
        };
        let outcome =
            authorize_connect(&auth, remote(), None, Some("hunter2"), None, "n", Utc::now());
        assert!(outcome.ok);
        assert_eq!(outcome.method, Some(AuthMethod::Password));
    }

    #[test]
    fn device_identity_verifies_signature_over_nonce() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let nonce = "challenge-nonce-123";
        let signature = signing.sign(nonce.as_bytes());
        let engine = base64::engine::general_purpose::STANDARD;

        let device = DeviceIdentity {
            id: "dev-1".into(),
            public_key: engine.encode(signing.verifying_key().to_bytes()),
            signature: engine.encode(signature.to_bytes()),
        };

        let outcome = verify_device_identity(&device, nonce, Utc::now());
        assert!(outcome.ok, "{:?}", outcome.reason);

        // Wrong nonce does not verify.
        let outcome = verify_device_identity(&device, "other-nonce", Utc::now());
        assert!(!outcome.ok);
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let nonce = "n";
        let engine = base64::engine::general_purpose::STANDARD;
        let device = DeviceIdentity {
            id: "dev".into(),
            public_key: engine.encode(signing.verifying_key().to_bytes()),
            signature: engine.encode(signing.sign(nonce.as_bytes()).to_bytes()),
        };

        let sent_at = Utc::now() - Duration::minutes(NONCE_MAX_AGE_MINUTES + 1);
        let outcome = verify_device_identity(&device, nonce, sent_at);
        assert!(!outcome.ok);
        assert!(outcome.reason.unwrap().contains("expired"));
    }

    #[test]
    fn device_identity_admits_remote_client() {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let nonce = "the-nonce";
        let engine = base64::engine::general_purpose::STANDARD;
        let device = DeviceIdentity {
            id: "dev".into(),
            public_key: engine.encode(signing.verifying_key().to_bytes()),
            signature: engine.encode(signing.sign(nonce.as_bytes()).to_bytes()),
        };

        let auth = token_auth("secret");
        let outcome = authorize_connect(
            &auth,
            remote(),
            None,
            None,
            Some(&device),
            nonce,
            Utc::now(),
        );
        assert!(outcome.ok);
        assert_eq!(outcome.method, Some(AuthMethod::DeviceIdentity));
    }
}
