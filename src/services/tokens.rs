//! Bearer and claim tokens. Only the SHA-256 of a token is ever stored.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 64 hex characters of randomness from two v4 UUIDs.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}
