//! Control API request signing.
//!
//! Every authenticated request carries `auth_key`, `auth_timestamp`,
//! `auth_version` and `auth_signature` query parameters, plus `body_md5`
//! when a body is present. The signature is
//! `HMAC-SHA256(secret, "METHOD\nPATH\nsorted-query")` where the query
//! string is rebuilt from the sorted parameters, excluding the signature
//! itself and a handful of routing artifacts.

use md5::{Digest, Md5};

use reverb_channels::auth;

/// Parameters that never participate in the signature.
const EXCLUDED_PARAMS: &[&str] = &["auth_signature", "body_md5", "appId", "appKey", "channelName"];

/// Rebuild the string the client signed.
pub fn signature_payload(
    method: &str,
    path: &str,
    params: &[(String, String)],
    body: &[u8],
) -> String {
    let mut filtered: Vec<(String, String)> = params
        .iter()
        .filter(|(key, _)| !EXCLUDED_PARAMS.contains(&key.as_str()))
        .cloned()
        .collect();
    if !body.is_empty() {
        filtered.push(("body_md5".into(), hex::encode(Md5::digest(body))));
    }
    filtered.sort();

    let query = filtered
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}\n{path}\n{query}", method.to_ascii_uppercase())
}

/// Constant-time verification of a request signature.
pub fn verify(
    secret: &str,
    method: &str,
    path: &str,
    params: &[(String, String)],
    body: &[u8],
    provided_signature: &str,
) -> bool {
    let payload = signature_payload(method, path, params, body);
    auth::verify_hex_signature(secret, &payload, provided_signature)
}
