//! Claim tokens
//!
//! A directory can hand out short-lived ownership claim tokens for a thing.
//! The node signs `{thing_id, username, timestamp}` with its ed25519 key and
//! ships the signature together with the public key, so a recipient can check
//! the claim without any prior key exchange. Tokens expire by age.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::types::{DirectoryError, Result};

/// The signed portion of a claim token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub thing_id: String,
    pub username: String,
    /// Epoch second of issuance
    pub timestamp: i64,
}

/// A self-contained claim: the signed fields plus the signature and the
/// issuer's public key, both base64url-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimToken {
    pub thing_id: String,
    pub username: String,
    pub timestamp: i64,
    pub signature: String,
    pub public_key: String,
}

impl ClaimToken {
    fn claim(&self) -> Claim {
        Claim {
            thing_id: self.thing_id.clone(),
            username: self.username.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Issues claim tokens with this node's signing key
pub struct TokenIssuer {
    signing: SigningKey,
}

impl TokenIssuer {
    /// Generate a fresh signing key for this node's lifetime
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// The node's verifying key, base64url-encoded
    pub fn verifying_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign a claim for a thing on behalf of a user
    pub fn issue(&self, thing_id: &str, username: &str) -> Result<ClaimToken> {
        let claim = Claim {
            thing_id: thing_id.to_string(),
            username: username.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = serde_json::to_vec(&claim)?;
        let signature = self.signing.sign(&payload);
        Ok(ClaimToken {
            thing_id: claim.thing_id,
            username: claim.username,
            timestamp: claim.timestamp,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            public_key: self.verifying_key(),
        })
    }
}

/// Check a token against the public key it carries, rejecting bad signatures
/// and stale timestamps
pub fn verify(token: &ClaimToken, max_age_seconds: i64) -> Result<()> {
    let key_bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(&token.public_key)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| DirectoryError::Unauthorized("malformed claim token key".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| DirectoryError::Unauthorized("malformed claim token key".to_string()))?;
    let signature_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(&token.signature)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| DirectoryError::Unauthorized("malformed claim token".to_string()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let payload = serde_json::to_vec(&token.claim())?;
    key.verify(&payload, &signature)
        .map_err(|_| DirectoryError::Unauthorized("claim token signature invalid".to_string()))?;

    let age = Utc::now().timestamp() - token.timestamp;
    if age < 0 || age > max_age_seconds {
        return Err(DirectoryError::Unauthorized(
            "claim token expired".to_string(),
        ));
    }
    Ok(())
}
