//! # Auth: Phones, Passwords, Tokens and Verification Codes
//!
//! Accounts are keyed by a Russian mobile number. Every accepted spelling
//! (`8 900 ...`, `+7 (900) ...`, `7900...`) is normalised to `+7XXXXXXXXXX`
//! before it touches the database, so uniqueness holds across formats.
//!
//! Passwords are hashed with Argon2id. Sessions are stateless HS256 JWTs
//! carrying the user id and role; handlers still reload the user on every
//! request so blocking an account takes effect immediately.

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::users::UserRole;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 128;
pub const CODE_LEN: usize = 6;

/// Normalise a phone number to `+7XXXXXXXXXX`.
///
/// Accepts 10 digits (no country code), or 11 digits starting with `7` or
/// `8`. Spaces, dashes, dots and parentheses are ignored. Returns `None` for
/// anything else.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut digits = String::with_capacity(11);
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if i == 0 => {}
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return None,
        }
    }
    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('7') || digits.starts_with('8') => &digits[1..],
        _ => return None,
    };
    // Russian area and mobile codes start with 3, 4, 8 or 9.
    if !matches!(national.as_bytes().first(), Some(b'3' | b'4' | b'8' | b'9')) {
        return None;
    }
    Some(format!("+7{}", national))
}

/// Check password length rules. Returns the user-facing message on failure.
pub fn validate_password(password: &str) -> Result<(), String> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LEN
        ));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash. Malformed hashes never match.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// JWT claims issued by the login and verification endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a signed session token valid for `ttl`.
pub fn issue_token(secret: &str, user_id: Uuid, role: UserRole, ttl: Duration) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        role,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Decode and verify a session token (signature and expiry).
pub fn decode_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Generate a zero-padded numeric verification code.
pub fn generate_code() -> String {
    let n = OsRng.next_u32() % 1_000_000;
    format!("{:0width$}", n, width = CODE_LEN)
}
