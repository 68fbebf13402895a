//! Webhook related structures

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{DeployError, Result};

type HmacSha256 = Hmac<Sha256>;

/// The parts of a GitHub push payload used to pick and log a deploy.
#[derive(Debug, Clone, Deserialize)]
pub struct PushDelivery {
    pub repository: PushRepository,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub pusher: Option<Pusher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: String,
}

impl PushDelivery {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| DeployError::BadRequest(format!("invalid push payload: {}", e)))
    }

    /// Branch name from `ref`, if the push was to a branch.
    pub fn branch(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .and_then(|r| r.strip_prefix("refs/heads/"))
    }
}

/// Check a `X-Hub-Signature-256` header value against the raw body.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex_decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    // constant time
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
