use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};

const VERIFIER_LENGTH: usize = 64;
const UNRESERVED: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._~";

/// 64 characters from the RFC 7636 unreserved set.
pub fn generate_code_verifier() -> String {
    (0..VERIFIER_LENGTH)
        .map(|_| UNRESERVED[OsRng.gen_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// `BASE64URL(SHA256(verifier))`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random session identifier, also used as the OAuth `state`.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
