//! Authentication with JWT bearer tokens and secure password handling.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;
use crate::settings::AuthConfig;

/// Seconds of clock skew tolerated when validating token expiry.
const EXPIRY_LEEWAY_SECONDS: u64 = 30;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (principal)
    pub exp: i64,    // Expiration time
    pub iat: i64,    // Issued at
}

/// The authenticated identity bound to a request, inserted into request
/// extensions by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct Principal(pub String);

/// Verifies `(username, password)` pairs against an in-memory credential
/// store and issues/validates signed bearer tokens. Sessions are stateless:
/// the token itself carries principal and expiry.
pub struct CredentialVerifier {
    users: DashMap<String, String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    expiration_minutes: i64,
}

impl CredentialVerifier {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let secret = config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| anyhow!("JWT secret not configured"))?;
        let algorithm = parse_algorithm(&config.jwt_algorithm)?;

        let users = DashMap::new();
        for user in &config.users {
            users.insert(user.username.clone(), user.password_hash.clone());
        }

        Ok(Self {
            users,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            expiration_minutes: config.jwt_expiration_minutes,
        })
    }

    /// Register a credential after construction. Used at startup when
    /// seeding and by tests.
    pub fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        self.users.insert(username.to_string(), hash);
        Ok(())
    }

    /// Verify the pair and emit a signed bearer token. Any failure returns
    /// the same opaque error.
    pub fn issue(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let hash = self
            .users
            .get(username)
            .map(|entry| entry.clone())
            .ok_or(ApiError::Unauthorized)?;

        if !verify_password(password, &hash).unwrap_or(false) {
            warn!(username, "failed authentication attempt");
            return Err(ApiError::Unauthorized);
        }

        let now = chrono::Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: (now + chrono::Duration::minutes(self.expiration_minutes)).timestamp(),
            iat: now.timestamp(),
        };

        encode(
            &Header::new(self.algorithm),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| ApiError::Internal(anyhow!("token generation failed: {e}")))
    }

    /// Validate signature, expiry, and structure; return the principal.
    pub fn verify(&self, token: &str) -> Result<String, ApiError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = EXPIRY_LEEWAY_SECONDS;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| ApiError::Unauthorized)?;
        Ok(data.claims.sub)
    }
}

pub fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(anyhow!("unsupported JWT algorithm '{other}'")),
    }
}

/// Hash a password with Argon2 and a fresh salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against its PHC hash. Argon2 verification is the
/// constant-time compare.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Extract the bearer token from the Authorization header.
pub fn extract_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let auth_header = headers
        .get("Authorization")
        .ok_or(ApiError::Unauthorized)?
        .to_str()
        .map_err(|_| ApiError::Unauthorized)?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

/// Authentication middleware: verifies the bearer token and inserts the
/// [`Principal`] into request extensions for downstream handlers.
pub async fn auth_middleware(
    State(verifier): State<Arc<CredentialVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers())?;
    let principal = verifier.verify(&token).map_err(|e| {
        warn!(path = %request.uri().path(), "rejected unauthorized request");
        e
    })?;

    request.extensions_mut().insert(Principal(principal));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_verifier(expiration_minutes: i64) -> CredentialVerifier {
        let config = AuthConfig {
            jwt_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
            jwt_algorithm: "HS256".to_string(),
            jwt_expiration_minutes: expiration_minutes,
            users: Vec::new(),
        };
        let verifier = CredentialVerifier::new(&config).unwrap();
        verifier.add_user("alice", "correct horse battery").unwrap();
        verifier
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("s3cret-pw").unwrap();
        assert!(verify_password("s3cret-pw", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let verifier = test_verifier(30);
        let token = verifier.issue("alice", "correct horse battery").unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn unknown_user_and_wrong_password_are_indistinguishable() {
        let verifier = test_verifier(30);
        let unknown = verifier.issue("bob", "whatever").unwrap_err();
        let wrong = verifier.issue("alice", "nope").unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(unknown.to_string(), "invalid credentials");
    }

    #[test]
    fn tampered_token_fails_verification() {
        let verifier = test_verifier(30);
        let token = verifier.issue("alice", "correct horse battery").unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn token_expired_beyond_leeway_is_rejected() {
        let verifier = test_verifier(30);
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".to_string(),
            exp: now - (EXPIRY_LEEWAY_SECONDS as i64) - 60,
            iat: now - 3_600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &verifier.encoding_key,
        )
        .unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn token_within_skew_leeway_still_verifies() {
        let verifier = test_verifier(30);
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".to_string(),
            exp: now - 5,
            iat: now - 3_600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &verifier.encoding_key,
        )
        .unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), "alice");
    }
}
