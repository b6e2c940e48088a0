//! Unique identifier generation for messages and tool calls.
//!
//! Identifiers only need to be unique within a conversation, so generation
//! is best-effort: the OS random source when available, a time-seeded
//! fallback otherwise. Secrets (the PKCE verifier) must NOT use this
//! module; see [`crate::auth::pkce`].

use std::time::{SystemTime, UNIX_EPOCH};

const URL_SAFE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";
const ALPHANUMERIC_ALPHABET: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a generic identifier, matching the common nanoid default.
const MESSAGE_ID_LEN: usize = 21;

/// Mistral rejects tool-call ids that are not exactly nine alphanumeric
/// characters.
const MISTRAL_TOOL_CALL_ID_LEN: usize = 9;

pub fn message_id() -> String {
    url_safe_id(MESSAGE_ID_LEN)
}

pub fn url_safe_id(len: usize) -> String {
    let bytes = best_effort_random_bytes(len);
    bytes
        .iter()
        .map(|byte| URL_SAFE_ALPHABET[(byte & 63) as usize] as char)
        .collect()
}

pub fn alphanumeric_short_id() -> String {
    let bytes = best_effort_random_bytes(MISTRAL_TOOL_CALL_ID_LEN);
    bytes
        .iter()
        .map(|byte| ALPHANUMERIC_ALPHABET[(*byte as usize) % ALPHANUMERIC_ALPHABET.len()] as char)
        .collect()
}

fn best_effort_random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0_u8; len];
    if getrandom::fill(&mut out).is_ok() {
        return out;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut x = nanos ^ ((std::process::id() as u64) << 32) ^ (len as u64);
    for byte in &mut out {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *byte = (x & 0xFF) as u8;
    }
    out
}
