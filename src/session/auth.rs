//! Password authentication.
//!
//! The server never sees the password on the wire: it issues a random
//! challenge and the client proves knowledge by returning
//! `HMAC-SHA1(password, challenge)`. A wrong response gets no feedback
//! beyond the transport closing.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Challenge size in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Draw a fresh random challenge.
pub fn generate_challenge() -> Vec<u8> {
    let mut salt = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    return salt;
}

/// The response a client sends for a challenge.
pub fn challenge_response(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key size");
    mac.update(challenge);
    return mac.finalize().into_bytes().to_vec();
}

/// Check a response in constant time.
pub fn verify_response(password: &str, challenge: &[u8], response: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key size");
    mac.update(challenge);
    return mac.verify_slice(response).is_ok();
}
