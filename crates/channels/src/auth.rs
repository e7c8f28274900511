//! Subscription authorization for private-family channels.
//!
//! The client presents `auth = "<app_key>:<hex signature>"` where the
//! signature is `HMAC-SHA256(app_secret, "<socket_id>:<channel>")`, with
//! `":<channel_data>"` appended when channel data is supplied. Verification
//! is constant-time; a malformed or wrong-length signature burns the same
//! HMAC work before failing.

use {
    hmac::{Hmac, Mac},
    sha2::Sha256,
};

use reverb_protocol::SocketId;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// The string a subscription signature is computed over.
pub fn signing_payload(socket_id: &SocketId, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    }
}

/// Hex-encoded `HMAC-SHA256(secret, message)`.
pub fn sign(secret: &str, message: &str) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(message.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        },
        // HMAC accepts keys of any length; this branch is unreachable.
        Err(_) => String::new(),
    }
}

/// Constant-time comparison of `provided_hex` against the expected
/// signature of `message`.
pub fn verify_hex_signature(secret: &str, message: &str, provided_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());

    match hex::decode(provided_hex) {
        Ok(bytes) if bytes.len() == SIGNATURE_LEN => mac.verify_slice(&bytes).is_ok(),
        _ => {
            // Wrong length or not hex: still run the compare so rejection
            // time does not reveal which check failed.
            let _ = mac.verify_slice(&[0u8; SIGNATURE_LEN]);
            false
        },
    }
}

/// Verify a `pusher:subscribe` auth token. Only the portion after the last
/// `:` participates in the comparison.
pub fn verify_subscription(
    secret: &str,
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
    auth: &str,
) -> bool {
    let provided = auth.rsplit(':').next().unwrap_or(auth);
    let payload = signing_payload(socket_id, channel, channel_data);
    verify_hex_signature(secret, &payload, provided)
}
