//! Password login and JWT session tokens.
//!
//! - Callers submit a password (optionally with a username) to `authenticate`
//! - A successful login yields an HS256 JWT carrying `sub`, `iat`, `exp` and `jti`
//! - Every registry and task-queue entry point calls `validate` before doing anything
//! - `logout` revokes the token id until the token would have expired anyway

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::FleetError;

/// Identity used for the plain `FLEET_PASSWORD` credential.
pub const DEFAULT_OWNER: &str = "operator";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    Rejected,
    #[error("session expired")]
    Expired,
    #[error("invalid session token")]
    Invalid,
    #[error("session was logged out")]
    Revoked,
    #[error("failed to issue session token: {0}")]
    Issue(String),
}

impl From<AuthError> for FleetError {
    fn from(e: AuthError) -> Self {
        FleetError::Auth(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Owner identity
    sub: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
    /// Token id, used for revocation
    jti: String,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub token: String,
    pub owner: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub jti: String,
}

impl Session {
    fn from_claims(token: &str, claims: Claims) -> Result<Self, AuthError> {
        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or(AuthError::Invalid)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(AuthError::Invalid)?;
        Ok(Self {
            token: token.to_string(),
            owner: claims.sub,
            issued_at,
            expires_at,
            jti: claims.jti,
        })
    }
}

/// Length-independent comparison: both sides are hashed first.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_hash = Sha256::digest(a.as_bytes());
    let b_hash = Sha256::digest(b.as_bytes());
    let mut diff: u8 = 0;
    for (x, y) in a_hash.iter().zip(b_hash.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Issues and checks session tokens.
pub struct SessionAuthenticator {
    config: AuthConfig,
    /// Revoked `jti` -> expiry (unix seconds)
    revoked: RwLock<HashMap<String, i64>>,
}

impl SessionAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            revoked: RwLock::new(HashMap::new()),
        }
    }

    fn check_credentials(&self, username: Option<&str>, password: &str) -> Option<String> {
        let password = password.trim();
        if password.is_empty() {
            return None;
        }
        let username = username.map(str::trim).filter(|u| !u.is_empty());

        let default_ok = self
            .config
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .is_some_and(|expected| constant_time_eq(password, expected));

        match username {
            None | Some(DEFAULT_OWNER) if default_ok => Some(DEFAULT_OWNER.to_string()),
            Some(name) => self
                .config
                .users
                .iter()
                .find(|(user, expected)| user == name && constant_time_eq(password, expected))
                .map(|(user, _)| user.clone()),
            None => None,
        }
    }

    /// Check a password and open a session.
    pub fn authenticate(
        &self,
        username: Option<&str>,
        password: &str,
    ) -> Result<Session, AuthError> {
        let Some(owner) = self.check_credentials(username, password) else {
            tracing::warn!("Rejected login for {}", username.unwrap_or(DEFAULT_OWNER));
            return Err(AuthError::Rejected);
        };
        let session = self.issue(&owner, Utc::now())?;
        tracing::info!(owner = %session.owner, jti = %session.jti, "Session opened");
        Ok(session)
    }

    fn issue(&self, owner: &str, issued_at: DateTime<Utc>) -> Result<Session, AuthError> {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .map_err(|e| AuthError::Issue(e.to_string()))?;
        let claims = Claims {
            sub: owner.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Issue(e.to_string()))?;
        Session::from_claims(&token, claims)
    }

    /// Check a token: signature, expiry (no leeway), and revocation.
    pub fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Invalid);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iat", "jti"]);

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid,
        })?;

        // The library only rejects exp < now; a token is dead at its exp second
        if data.claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        let revoked = self
            .revoked
            .read()
            .map(|r| r.contains_key(&data.claims.jti))
            .unwrap_or(true);
        if revoked {
            return Err(AuthError::Revoked);
        }

        Session::from_claims(token, data.claims)
    }

    /// Revoke a session. Logging out an already revoked session is an error.
    pub fn logout(&self, token: &str) -> Result<Session, AuthError> {
        let session = self.validate(token)?;
        let now = Utc::now().timestamp();
        let mut revoked = self
            .revoked
            .write()
            .map_err(|_| AuthError::Issue("revocation list poisoned".to_string()))?;
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(session.jti.clone(), session.expires_at.timestamp());
        tracing::info!(owner = %session.owner, jti = %session.jti, "Session closed");
        Ok(session)
    }

    /// Number of revoked sessions still tracked.
    pub fn revoked_count(&self) -> usize {
        self.revoked.read().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(AuthConfig {
            password: Some("hunter2".to_string()),
            users: vec![("alice".to_string(), "wonderland".to_string())],
            jwt_secret: "test-secret".to_string(),
            session_ttl: Duration::from_secs(600),
        })
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_authenticate_and_validate() {
        let auth = authenticator();
        let session = auth.authenticate(None, "hunter2").unwrap();
        assert_eq!(session.owner, DEFAULT_OWNER);
        assert!(session.expires_at > session.issued_at);

        let validated = auth.validate(&session.token).unwrap();
        assert_eq!(validated.owner, DEFAULT_OWNER);
        assert_eq!(validated.jti, session.jti);
    }

    #[test]
    fn test_named_users() {
        let auth = authenticator();
        let session = auth.authenticate(Some("alice"), "wonderland").unwrap();
        assert_eq!(session.owner, "alice");
        assert_eq!(
            auth.authenticate(Some("alice"), "hunter2"),
            Err(AuthError::Rejected)
        );
        assert_eq!(
            auth.authenticate(Some("bob"), "wonderland"),
            Err(AuthError::Rejected)
        );
        assert_eq!(auth.authenticate(None, "wonderland"), Err(AuthError::Rejected));
    }

    #[test]
    fn test_wrong_or_empty_password_rejected() {
        let auth = authenticator();
        assert_eq!(auth.authenticate(None, "nope"), Err(AuthError::Rejected));
        assert_eq!(auth.authenticate(None, ""), Err(AuthError::Rejected));
    }

    #[test]
    fn test_expired_token() {
        let auth = authenticator();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let session = auth.issue(DEFAULT_OWNER, long_ago).unwrap();
        assert_eq!(auth.validate(&session.token), Err(AuthError::Expired));
    }

    #[test]
    fn test_token_expires_exactly_at_exp() {
        let auth = authenticator();
        let issued = Utc::now() - chrono::Duration::seconds(600);
        let session = auth.issue(DEFAULT_OWNER, issued).unwrap();
        assert_eq!(auth.validate(&session.token), Err(AuthError::Expired));
    }

    #[test]
    fn test_invalid_tokens() {
        let auth = authenticator();
        assert_eq!(auth.validate(""), Err(AuthError::Invalid));
        assert_eq!(auth.validate("not-a-jwt"), Err(AuthError::Invalid));

        let other = SessionAuthenticator::new(AuthConfig {
            password: Some("hunter2".to_string()),
            users: Vec::new(),
            jwt_secret: "different-secret".to_string(),
            session_ttl: Duration::from_secs(600),
        });
        let foreign = other.authenticate(None, "hunter2").unwrap();
        assert_eq!(auth.validate(&foreign.token), Err(AuthError::Invalid));
    }

    #[test]
    fn test_logout_revokes() {
        let auth = authenticator();
        let session = auth.authenticate(None, "hunter2").unwrap();
        let other = auth.authenticate(None, "hunter2").unwrap();

        auth.logout(&session.token).unwrap();
        assert_eq!(auth.validate(&session.token), Err(AuthError::Revoked));
        assert_eq!(auth.logout(&session.token), Err(AuthError::Revoked));
        assert!(auth.validate(&other.token).is_ok());
        assert_eq!(auth.revoked_count(), 1);
    }

    #[test]
    fn test_auth_error_maps_to_fleet_error() {
        let err: FleetError = AuthError::Expired.into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }
}
