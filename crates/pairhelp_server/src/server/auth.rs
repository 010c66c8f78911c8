#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token format")]
	Format,

	#[error("invalid token encoding: {0}")]
	Encoding(#[from] base64::DecodeError),

	#[error("invalid token signature")]
	Signature,

	#[error("invalid token claims: {0}")]
	Claims(#[from] serde_json::Error),

	#[error("token expired")]
	Expired,

	#[error("invalid hmac key")]
	Key,
}

/// Claims carried by a `v1.<claims>.<sig>` bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Contact key the token was issued to.
	pub sub: String,
	/// Expiry, Unix seconds.
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Format);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Signature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload)?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token for `sub` expiring at `exp` (Unix seconds).
pub fn issue_hmac_token(sub: &str, exp: u64, secret: &str) -> Result<String, AuthError> {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp,
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::Key)?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
