
use rand::{thread_rng, Rng};

/// ice-char = ALPHA / DIGIT / "+" / "/" (RFC 5245 §15.1); used for
/// candidate ids.
const ICE_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/+";

/// Credentials stick to plain letters so they survive any signalling path.
const CREDENTIAL_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Local ufrag length. The protocol floor is 4 characters.
const UFRAG_LEN: usize = 8;

/// Local password length. The protocol floor is 22 characters.
const PWD_LEN: usize = 24;

fn random_string(len: usize, alphabet: &[u8]) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// A fresh candidate id. Ids only need to be unique within the agent;
/// 32 ice-chars give far more entropy than that requires.
pub fn generate_cand_id() -> String {
    format!("candidate:{}", random_string(32, ICE_CHARS))
}

/// A fresh connectivity-check password.
pub fn generate_pwd() -> String {
    random_string(PWD_LEN, CREDENTIAL_CHARS)
}

/// A fresh username fragment.
pub fn generate_ufrag() -> String {
    random_string(UFRAG_LEN, CREDENTIAL_CHARS)
}

/// The 64-bit tie-breaker used for role conflict resolution.
pub fn generate_tie_breaker() -> u64 {
    thread_rng().gen::<u64>()
}
