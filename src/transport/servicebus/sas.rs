//! Shared Access Signature tokens.
//!
//! A token authorizes requests against a resource URI until its expiry:
//!
//! ```text
//! SharedAccessSignature sr={uri}&sig={signature}&se={expiry}&skn={key name}
//! ```
//!
//! where `signature = base64(hmac_sha256(key, "{uri}\n{expiry}"))` and `uri`
//! is the percent-encoded, lower-cased resource URI.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::encoding::percent_encode;
use crate::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Build a token for `resource` valid until `expiry` (seconds since epoch).
pub(crate) fn token(resource: &str, key_name: &str, key: &str, expiry: u64) -> Result<String> {
    // ---
    let encoded_resource = percent_encode(&resource.to_lowercase(), b"");
    let string_to_sign = format!("{encoded_resource}\n{expiry}");

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| RelayError::Transport(format!("servicebus: invalid SAS key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}&skn={}",
        percent_encode(&signature, b""),
        percent_encode(key_name, b""),
    ))
}

/// Expiry `ttl` from now, in seconds since epoch.
pub(crate) fn expiry_in(ttl: Duration) -> Result<u64> {
    // ---
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RelayError::Transport(format!("system clock before epoch: {e}")))?;
    Ok((now + ttl).as_secs())
}
