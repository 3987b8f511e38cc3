// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::InsightsError;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{pbkdf2_hmac, Params, Pbkdf2};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Claims carried by a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    /// Makes every issued token distinct, even for the same user and second.
    pub random_uid: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 token issuer and verifier.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, InsightsError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            random_uid: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| InsightsError::InternalError(format!("Failed to issue token: {e}")))
    }

    /// User id of a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Option<String> {
        match decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256)) {
            Ok(data) => Some(data.claims.user_id),
            Err(e) => {
                debug!("Rejected token: {e}");
                None
            }
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ============================================
// Passwords
// ============================================

/// Hash a password into a PHC `$pbkdf2-sha256$` string.
pub fn hash_password(password: &str, rounds: u32) -> Result<String, InsightsError> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| InsightsError::InternalError(format!("Failed to encode salt: {e}")))?;

    let params = Params {
        rounds,
        output_length: 32,
    };
    let hash = Pbkdf2
        .hash_password_customized(
            password.as_bytes(),
            Some(pbkdf2::Algorithm::Pbkdf2Sha256.ident()),
            None,
            params,
            &salt,
        )
        .map_err(|e| InsightsError::InternalError(format!("Failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Check a password against a stored hash.
///
/// Accepts PHC strings and the Werkzeug `pbkdf2:sha256[:iterations]$salt$hex`
/// and `scrypt[:n:r:p]$salt$hex` hashes left by earlier deployments. Anything
/// else never verifies.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with('$') {
        return match PasswordHash::new(stored) {
            Ok(parsed) => Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        };
    }
    verify_werkzeug(password, stored).unwrap_or(false)
}

fn verify_werkzeug(password: &str, stored: &str) -> Option<bool> {
    let mut parts = stored.splitn(3, '$');
    let method = parts.next()?;
    let salt = parts.next()?;
    let expected = parts.next()?;

    let mut method_parts = method.split(':');
    let derived = match method_parts.next()? {
        "pbkdf2" => {
            if method_parts.next().unwrap_or("sha256") != "sha256" {
                return None;
            }
            let iterations: u32 = match method_parts.next() {
                Some(n) => n.parse().ok()?,
                None => 600_000,
            };
            let mut derived = vec![0u8; 32];
            pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut derived);
            derived
        }
        "scrypt" => {
            let n: u64 = method_parts.next().unwrap_or("32768").parse().ok()?;
            let r: u32 = method_parts.next().unwrap_or("8").parse().ok()?;
            let p: u32 = method_parts.next().unwrap_or("1").parse().ok()?;
            if !n.is_power_of_two() {
                return None;
            }
            let params = scrypt::Params::new(n.trailing_zeros() as u8, r, p, 64).ok()?;
            let mut derived = vec![0u8; 64];
            scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut derived).ok()?;
            derived
        }
        _ => return None,
    };
    let derived_hex: String = derived.iter().map(|b| format!("{b:02x}")).collect();

    Some(derived_hex.as_bytes().ct_eq(expected.as_bytes()).into())
}
