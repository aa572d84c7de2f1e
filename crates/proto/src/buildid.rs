//! Per-build identifiers.
//!
//! A build id doubles as the name of that build's workspace directory
//! under the cache root, so the character set is restricted to things that
//! are safe in a path component.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;

/// Fixed prefix of every build id (and every workspace directory name).
pub const BUILD_ID_PREFIX: &str = "b-";

/// Generate a fresh build id: 18 random bytes, url-safe base64, with the
/// two non-alphanumeric output characters substituted away.
#[must_use]
pub fn generate() -> String {
    let mut buf = [0u8; 18];
    rand::rng().fill_bytes(&mut buf);
    let tail = URL_SAFE_NO_PAD
        .encode(buf)
        .replace('-', "a")
        .replace('_', "b");
    format!("{BUILD_ID_PREFIX}{tail}")
}

/// Whether `id` matches `^b-[A-Za-z0-9]{16,64}$`.
#[must_use]
pub fn validate(id: &str) -> bool {
    let Some(tail) = id.strip_prefix(BUILD_ID_PREFIX) else {
        return false;
    };
    (16..=64).contains(&tail.len()) && tail.bytes().all(|b| b.is_ascii_alphanumeric())
}
