//! Key encodings used by the wire protocols.

use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;

/// URL-safe base64 of the key bytes, padding stripped, as the service's
/// `{encKey}` path element.
pub(crate) fn encode_key(key: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Encoded `bucket:key` entry used by the metadata endpoints.
pub(crate) fn encode_entry(bucket: &str, key: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(format!("{bucket}:{key}").as_bytes())
}

/// Path-escapes a key for the download URL, preserving `/` separators.
pub(crate) fn escape_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
