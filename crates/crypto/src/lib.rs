use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

mod hex;

pub use hex::encode_hex;

const HASH_ALGO: &str = "sha512";
const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;

/// Alphabet for human-readable codes, with visually ambiguous glyphs removed.
pub const HUMAN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuwxyz23456789";

/// Hashes a password with a fresh random salt.
/// Output format: `<algo>:<hashBase64>:<saltBase64>`.
pub fn hash_password(pass: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = salted_digest(pass, &salt);
    format!(
        "{}:{}:{}",
        HASH_ALGO,
        STANDARD.encode(digest),
        STANDARD.encode(salt)
    )
}

/// Verifies a password against a stored hash in constant time.
/// Malformed stored values simply fail verification.
pub fn check_password(pass: &str, stored: &str) -> bool {
    let mut parts = stored.split(':');
    let (Some(algo), Some(hash), Some(salt)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if parts.next().is_some() || algo != HASH_ALGO {
        return false;
    }
    let (Ok(hash), Ok(salt)) = (STANDARD.decode(hash), STANDARD.decode(salt)) else {
        return false;
    };
    let digest = salted_digest(pass, &salt);
    digest.as_slice().ct_eq(&hash).into()
}

fn salted_digest(pass: &str, salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(pass.as_bytes());
    hasher.finalize().to_vec()
}

/// Generates a uniform zero-padded numeric code.
pub fn random_code(digits: u32) -> String {
    let bound = 10u64.pow(digits);
    let value = OsRng.gen_range(0..bound);
    format!("{:0width$}", value, width = digits as usize)
}

/// Generates an opaque session token: 32 random bytes as hex.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut bytes);
    encode_hex(&bytes)
}

/// Generates a human-readable code over [`HUMAN_ALPHABET`].
pub fn human_code(len: usize) -> String {
    let mut code = String::with_capacity(len);
    for _ in 0..len {
        let index = OsRng.gen_range(0..HUMAN_ALPHABET.len());
        code.push(char::from(HUMAN_ALPHABET[index]));
    }
    code
}
