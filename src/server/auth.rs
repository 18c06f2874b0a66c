use hmac::{ Hmac, Mac };
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;
use url::form_urlencoded;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signed timestamps older or newer than this are refused.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Who is on the other end of a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing uid")]
    MissingUser,
    #[error("missing ts/sig")]
    MissingSignature,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("timestamp out of range")]
    Expired,
    #[error("bad signature")]
    BadSignature,
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

/// Hex HMAC-SHA256 over `"{ts}:{uid}"`.
pub fn sign(secret: &str, ts: i64, user_id: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => {
            return String::new();
        }
    };
    mac.update(format!("{}:{}", ts, user_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &str, ts: i64, user_id: &str, sig: &str) -> bool {
    let bytes = match hex::decode(sig) {
        Ok(bytes) => bytes,
        Err(_) => {
            return false;
        }
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => {
            return false;
        }
    };
    mac.update(format!("{}:{}", ts, user_id).as_bytes());
    mac.verify_slice(&bytes).is_ok()
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves the caller from handshake/query parameters `uid`, `email`,
/// `ts` and `sig`.
///
/// With a secret configured the signature and timestamp are mandatory.
/// Without one, the given `uid` is trusted and a missing `uid` gets a fresh
/// anonymous id.
pub fn authenticate(
    params: &HashMap<String, String>,
    secret: Option<&str>,
    now_secs: i64
) -> Result<Identity, AuthError> {
    let email = non_empty(params, "email");
    let secret = match secret.filter(|s| !s.is_empty()) {
        Some(secret) => secret,
        None => {
            let user_id = non_empty(params, "uid").unwrap_or_else(|| format!("anon_{}", Uuid::new_v4()));
            return Ok(Identity { user_id, email });
        }
    };

    let user_id = non_empty(params, "uid").ok_or(AuthError::MissingUser)?;
    let (ts, sig) = match (non_empty(params, "ts"), non_empty(params, "sig")) {
        (Some(ts), Some(sig)) => (ts, sig),
        _ => {
            return Err(AuthError::MissingSignature);
        }
    };
    let ts: i64 = ts.parse().map_err(|_| AuthError::InvalidTimestamp)?;
    if now_secs.abs_diff(ts) > MAX_CLOCK_SKEW_SECS as u64 {
        return Err(AuthError::Expired);
    }
    if !verify_signature(secret, ts, &user_id, &sig) {
        return Err(AuthError::BadSignature);
    }
    Ok(Identity { user_id, email })
}
