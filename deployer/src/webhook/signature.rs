//! Webhook signature verification

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::errors::DeployError;

type HmacSha256 = Hmac<Sha256>;

/// Verify an HMAC-SHA256 signature over the exact delivered bytes.
///
/// `signature` is hex, optionally prefixed with `sha256=`. The digest
/// comparison is constant-time.
pub fn verify_signature(
    secret: Option<&SecretString>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), DeployError> {
    let secret = secret
        .filter(|s| !s.expose_secret().is_empty())
        .ok_or_else(|| DeployError::AuthError("webhook secret is not configured".to_string()))?;

    let signature = signature
        .map(str::trim)
        .map(|s| s.strip_prefix("sha256=").unwrap_or(s))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DeployError::AuthError("missing signature".to_string()))?;

    let expected = hex::decode(signature)
        .map_err(|_| DeployError::AuthError("signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| DeployError::AuthError(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| DeployError::AuthError("signature mismatch".to_string()))
}

/// Hex signature of `body`, prefixed with `sha256=`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, DeployError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeployError::AuthError(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
