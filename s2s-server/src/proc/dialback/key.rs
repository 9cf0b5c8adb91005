//! Dialback key generation (XEP-0185).
//!
//! `key = HEX(HMAC-SHA256(HEX(SHA256(secret)), "receiving originating stream_id"))`

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::S2sError;

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(
    secret: &str,
    receiving: &str,
    originating: &str,
    stream_id: &str,
) -> Result<HmacSha256, S2sError> {
    let hashed_secret = hex::encode(Sha256::digest(secret.as_bytes()));
    let mut mac = HmacSha256::new_from_slice(hashed_secret.as_bytes())
        .map_err(|e| S2sError::Crypto(e.to_string()))?;
    mac.update(receiving.as_bytes());
    mac.update(b" ");
    mac.update(originating.as_bytes());
    mac.update(b" ");
    mac.update(stream_id.as_bytes());
    Ok(mac)
}

/// Key an originating server sends to a receiving server on the stream
/// identified by `stream_id`.
pub fn dialback_key(
    secret: &str,
    receiving: &str,
    originating: &str,
    stream_id: &str,
) -> Result<String, S2sError> {
    let mac = keyed_mac(secret, receiving, originating, stream_id)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a key presented in `<db:verify>`.
pub fn verify_key(
    secret: &str,
    receiving: &str,
    originating: &str,
    stream_id: &str,
    key: &str,
) -> Result<bool, S2sError> {
    let Ok(presented) = hex::decode(key.trim()) else {
        return Ok(false);
    };
    let mac = keyed_mac(secret, receiving, originating, stream_id)?;
    Ok(mac.verify_slice(&presented).is_ok())
}
