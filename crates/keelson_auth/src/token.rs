//! HMAC-SHA256-signed bearer tokens.
//!
//! Tokens are compact three-part strings
//! (`base64url(header).base64url(claims).base64url(signature)`) with JSON
//! claims. The auth service mints them on login; the game server verifies
//! them during the join handshake with the same shared secret.

use std::time::Duration;

use base64::prelude::*;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated disagreement between the issuer's clock and the verifier's.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token issuer is not trusted")]
    WrongIssuer,
    #[error("token is not valid yet")]
    NotYetValid,
}

/// The claims carried in a session token.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the account's user id.
    pub sub: Uuid,
    /// The account's username at issue time.
    pub name: String,
    pub iss: String,
    pub aud: String,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Unique token id.
    pub jti: Uuid,
}

#[derive(Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

/// Mints and verifies session tokens against one shared secret.
#[derive(Clone)]
pub struct TokenAuthority {
    secret: Vec<u8>,
    issuer: String,
    audience: String,
    lifetime: Duration,
}

impl TokenAuthority {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        lifetime: Duration,
    ) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
            audience: audience.into(),
            lifetime,
        }
    }

    /// A verify-only authority, for services that never mint tokens.
    pub fn verifier(
        secret: impl Into<Vec<u8>>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self::new(secret, issuer, audience, Duration::ZERO)
    }

    /// Issues a signed token for `user_id` at time `now`. Returns the
    /// token string and its expiry.
    pub fn issue(&self, user_id: Uuid, username: &str, now: u64) -> (String, u64) {
        let exp = now + self.lifetime.as_secs();

        let claims = Claims {
            sub: user_id,
            name: username.to_owned(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp,
            jti: Uuid::new_v4(),
        };

        let header = serde_json::to_vec(&Header {
            alg: "HS256",
            typ: "JWT",
        })
        .expect("header serialization cannot fail");
        let body = serde_json::to_vec(&claims).expect("claims serialization cannot fail");

        let mut token = String::new();
        token.push_str(&BASE64_URL_SAFE_NO_PAD.encode(header));
        token.push('.');
        token.push_str(&BASE64_URL_SAFE_NO_PAD.encode(body));

        let signature = self.sign(token.as_bytes());
        token.push('.');
        token.push_str(&BASE64_URL_SAFE_NO_PAD.encode(signature));

        (token, exp)
    }

    /// Verifies signature, issuer, and expiry at time `now`, with
    /// [`CLOCK_SKEW`] of tolerance, and returns the claims.
    pub fn verify(&self, token: &str, now: u64) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');

        let (Some(header), Some(body), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        // Signature first; nothing inside an unsigned token is worth
        // parsing.
        let signed_len = header.len() + 1 + body.len();
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenError::InvalidSignature)?;
        mac.update(&token.as_bytes()[..signed_len]);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let body = BASE64_URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)?;

        if claims.iss != self.issuer {
            return Err(TokenError::WrongIssuer);
        }

        // Expiry is strict; the skew allowance only covers tokens whose
        // issuer clock runs ahead of ours.
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        if claims.iat > now + CLOCK_SKEW.as_secs() {
            return Err(TokenError::NotYetValid);
        }

        Ok(claims)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
