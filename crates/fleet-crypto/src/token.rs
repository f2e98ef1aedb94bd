//! Compact signed session tokens.
//!
//! Wire form is `base64url(json_payload) . base64url(der_signature)`. The
//! payload carries a `kind` discriminator so a management token presented
//! where an agent token is required fails with [`TokenError::WrongVariant`]
//! instead of silently parsing. Decoding checks the signature only; whether
//! the token matches a live session is the registry's separate concern.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("wrong token variant: expected {expected}, found {found}")]
    WrongVariant {
        expected: &'static str,
        found: &'static str,
    },
}

/// Token issued to an agent. Identity is the structural tuple
/// `(server_id, agent_id, issued_at_ms, ttl_ms)`; none of the fields
/// mutate after issuance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentToken {
    pub server_id: String,
    pub agent_id: Uuid,
    pub issued_at_ms: u64,
    pub ttl_ms: u64,
}

/// Token issued to a management (operator) session, keyed by source IP.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManagementToken {
    pub server_id: String,
    pub client_ip: String,
    pub issued_at_ms: u64,
    pub ttl_ms: u64,
}

impl AgentToken {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) >= self.ttl_ms
    }
}

impl ManagementToken {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) >= self.ttl_ms
    }
}

/// Token authorizing a new machine to join the fleet. Carries a digest of
/// the issuing server's id; it stops working when the server restarts and
/// its id changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeployToken {
    pub server_id: String,
    pub hash: String,
}

/// The token variants as a tagged sum, discriminated by `kind`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Token {
    #[serde(rename = "agent")]
    Agent(AgentToken),
    #[serde(rename = "mgmt")]
    Management(ManagementToken),
    #[serde(rename = "deploy")]
    Deploy(DeployToken),
}

impl Token {
    pub fn kind(&self) -> &'static str {
        match self {
            Token::Agent(_) => "agent",
            Token::Management(_) => "mgmt",
            Token::Deploy(_) => "deploy",
        }
    }

    pub fn into_agent(self) -> Result<AgentToken, TokenError> {
        match self {
            Token::Agent(t) => Ok(t),
            other => Err(TokenError::WrongVariant {
                expected: "agent",
                found: other.kind(),
            }),
        }
    }

    pub fn into_management(self) -> Result<ManagementToken, TokenError> {
        match self {
            Token::Management(t) => Ok(t),
            other => Err(TokenError::WrongVariant {
                expected: "mgmt",
                found: other.kind(),
            }),
        }
    }

    pub fn into_deploy(self) -> Result<DeployToken, TokenError> {
        match self {
            Token::Deploy(t) => Ok(t),
            other => Err(TokenError::WrongVariant {
                expected: "deploy",
                found: other.kind(),
            }),
        }
    }
}

/// Sign and encode a token for the wire.
pub fn encode(token: &Token, key: &SigningKey) -> Result<String, TokenError> {
    let payload = serde_json::to_vec(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
    Ok(encode_parts(&payload, key))
}

/// Decode a wire token, verifying its signature against the server key.
pub fn decode(wire: &str, key: &VerifyingKey) -> Result<Token, TokenError> {
    let payload = decode_parts(wire, key)?;
    serde_json::from_slice(&payload).map_err(|e| TokenError::Malformed(e.to_string()))
}

/// Sign an arbitrary JSON value in the same two-part wire format. Used for
/// the operation-queue snapshots handed to agents.
pub fn seal(value: &serde_json::Value, key: &SigningKey) -> Result<String, TokenError> {
    let payload = serde_json::to_vec(value).map_err(|e| TokenError::Malformed(e.to_string()))?;
    Ok(encode_parts(&payload, key))
}

/// Verify and unwrap a sealed JSON payload.
pub fn open(wire: &str, key: &VerifyingKey) -> Result<serde_json::Value, TokenError> {
    let payload = decode_parts(wire, key)?;
    serde_json::from_slice(&payload).map_err(|e| TokenError::Malformed(e.to_string()))
}

fn encode_parts(payload: &[u8], key: &SigningKey) -> String {
    let sig: Signature = key.sign(payload);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload),
        URL_SAFE_NO_PAD.encode(sig.to_der().as_bytes())
    )
}

fn decode_parts(wire: &str, key: &VerifyingKey) -> Result<Vec<u8>, TokenError> {
    let mut parts = wire.split('.');
    let (payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(s), None) => (p, s),
        _ => return Err(TokenError::Malformed("expected two dot-separated parts".to_string())),
    };

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed("payload is not valid base64".to_string()))?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed("signature is not valid base64".to_string()))?;
    let sig = Signature::from_der(&sig_bytes).map_err(|_| TokenError::InvalidSignature)?;

    key.verify(&payload, &sig)
        .map_err(|_| TokenError::InvalidSignature)?;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn test_key() -> SigningKey {
        SigningKey::random(&mut OsRng)
    }

    fn agent_token() -> Token {
        Token::Agent(AgentToken {
            server_id: "srv-1".to_string(),
            agent_id: Uuid::new_v4(),
            issued_at_ms: 1_700_000_000_000,
            ttl_ms: 1_800_000,
        })
    }

    #[test]
    fn encode_decode_round_trip() {
        let key = test_key();
        let token = agent_token();
        let wire = encode(&token, &key).unwrap();
        let decoded = decode(&wire, key.verifying_key()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn management_round_trip() {
        let key = test_key();
        let token = Token::Management(ManagementToken {
            server_id: "srv-1".to_string(),
            client_ip: "203.0.113.9".to_string(),
            issued_at_ms: 42,
            ttl_ms: 600_000,
        });
        let wire = encode(&token, &key).unwrap();
        assert_eq!(decode(&wire, key.verifying_key()).unwrap(), token);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let key = test_key();
        let wire = encode(&agent_token(), &key).unwrap();
        let (payload, sig) = wire.split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        // Flip one byte inside the JSON payload.
        let pos = bytes.len() / 2;
        bytes[pos] ^= 0x01;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&bytes), sig);
        assert_eq!(
            decode(&forged, key.verifying_key()).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn wrong_key_fails_signature() {
        let key = test_key();
        let other = test_key();
        let wire = encode(&agent_token(), &key).unwrap();
        assert_eq!(
            decode(&wire, other.verifying_key()).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn malformed_wire_forms() {
        let key = test_key();
        for bad in ["", "no-dots-here", "a.b.c", "!!!.###"] {
            match decode(bad, key.verifying_key()) {
                Err(TokenError::Malformed(_)) | Err(TokenError::InvalidSignature) => {}
                other => panic!("expected malformed/invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn wrong_variant_is_rejected() {
        let key = test_key();
        let wire = encode(&agent_token(), &key).unwrap();
        let decoded = decode(&wire, key.verifying_key()).unwrap();
        let err = decoded.into_management().unwrap_err();
        assert_eq!(
            err,
            TokenError::WrongVariant {
                expected: "mgmt",
                found: "agent"
            }
        );
    }

    #[test]
    fn deploy_round_trip_and_variant_check() {
        let key = test_key();
        let token = Token::Deploy(DeployToken {
            server_id: "srv-1".to_string(),
            hash: "ab".repeat(32),
        });
        let wire = encode(&token, &key).unwrap();
        let decoded = decode(&wire, key.verifying_key()).unwrap();
        assert_eq!(decoded.clone().into_deploy().unwrap().hash, "ab".repeat(32));
        assert_eq!(
            decoded.into_agent().unwrap_err(),
            TokenError::WrongVariant {
                expected: "agent",
                found: "deploy"
            }
        );
    }

    #[test]
    fn seal_open_round_trip() {
        let key = test_key();
        let value = serde_json::json!({"queue": [{"sequence": 0, "kind": "reboot"}]});
        let wire = seal(&value, &key).unwrap();
        assert_eq!(open(&wire, key.verifying_key()).unwrap(), value);
    }

    #[test]
    fn expiry_math() {
        let token = AgentToken {
            server_id: "s".to_string(),
            agent_id: Uuid::new_v4(),
            issued_at_ms: 1000,
            ttl_ms: 500,
        };
        assert!(!token.is_expired(1499));
        assert!(token.is_expired(1500));
        // Clock skew before issuance never underflows.
        assert!(!token.is_expired(0));
    }
}
