//! Signed bearer tokens (HS256).
//!
//! The token carries identity; the opaque session token carries liveness.
//! Both are required on protected routes, and a session remembers only the
//! SHA-256 of the signed token it was created with.

use chrono::Duration;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::admin::Admin;
use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::realm::Realm;
use crate::security::SecurityError;

/// How strictly incoming tokens are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Issuer and audience must match; only the primary secret is accepted.
    Strict,
    /// No issuer/audience check; development tokens may use the fallback secret.
    Lenient,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: String, // admin id
    pub phone: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub jti: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

impl From<TokenError> for SecurityError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => SecurityError::TokenExpired,
            TokenError::Invalid(_) => SecurityError::TokenInvalid,
            TokenError::Encoding(e) => SecurityError::Internal(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub mode: AuthMode,
    pub secret: String,
    pub dev_secret: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
    pub dev_phone: Option<String>,
}

impl TokenSettings {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            mode: config.auth_mode,
            secret: config.jwt_secret.clone(),
            dev_secret: config.dev_jwt_secret.clone().filter(|s| !s.is_empty()),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            ttl: Duration::seconds(config.token_ttl_secs),
            dev_phone: config.dev_phone.clone().filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: Claims,
    pub realm: Realm,
}

pub struct TokenService {
    settings: TokenSettings,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(settings: TokenSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    pub fn realm_for(&self, phone: &str) -> Realm {
        Realm::for_phone(phone, self.settings.dev_phone.as_deref())
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    /// Issue a token for `admin`, always signed with the primary secret.
    pub fn issue(&self, admin: &Admin) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = Claims {
            sub: admin.id.to_string(),
            phone: admin.phone_number.clone(),
            role: admin.role.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + self.settings.ttl).timestamp(),
            iss: Some(self.settings.issuer.clone()),
            aud: Some(self.settings.audience.clone()),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.settings.secret.as_bytes()),
        )
        .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let claims = match self.decode_with(token, &self.settings.secret) {
            Ok(claims) => claims,
            Err(ErrorKind::InvalidSignature) if self.settings.mode == AuthMode::Lenient => {
                let Some(dev_secret) = self.settings.dev_secret.as_deref() else {
                    return Err(TokenError::Invalid("signature".into()));
                };
                let claims = self
                    .decode_with(token, dev_secret)
                    .map_err(|kind| TokenError::Invalid(format!("{:?}", kind)))?;
                // The fallback secret only ever vouches for the development identity.
                if !self.realm_for(&claims.phone).is_development() {
                    return Err(TokenError::Invalid("fallback secret outside development realm".into()));
                }
                claims
            }
            Err(kind) => return Err(TokenError::Invalid(format!("{:?}", kind))),
        };

        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }

        let realm = self.realm_for(&claims.phone);
        Ok(VerifiedToken { claims, realm })
    }

    /// Signature and claim-shape check only; expiry is compared against the
    /// injected clock by the caller.
    fn decode_with(&self, token: &str, secret: &str) -> Result<Claims, ErrorKind> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        match self.settings.mode {
            AuthMode::Strict => {
                validation.set_issuer(&[&self.settings.issuer]);
                validation.set_audience(&[&self.settings.audience]);
            }
            AuthMode::Lenient => {
                validation.validate_aud = false;
            }
        }
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| e.into_kind())
    }
}

/// SHA-256 of a signed token, hex encoded.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    const DEV_SECRET: &str = "dev-dev-dev-dev-dev-dev-dev-dev-dev";
    const DEV_PHONE: &str = "+919999999999";

    fn settings(mode: AuthMode) -> TokenSettings {
        TokenSettings {
            mode,
            secret: SECRET.into(),
            dev_secret: Some(DEV_SECRET.into()),
            issuer: "propdesk".into(),
            audience: "propdesk-admin".into(),
            ttl: Duration::hours(1),
            dev_phone: Some(DEV_PHONE.into()),
        }
    }

    fn service(mode: AuthMode) -> (TokenService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (TokenService::new(settings(mode), clock.clone()), clock)
    }

    fn admin(phone: &str) -> Admin {
        Admin::new(phone, "Test", chrono::Utc::now())
    }

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_issue_then_verify() {
        let (svc, _) = service(AuthMode::Strict);
        let admin = admin("+919876543210");
        let token = svc.issue(&admin).unwrap();

        let verified = svc.verify(&token).unwrap();
        assert_eq!(verified.claims.sub, admin.id.to_string());
        assert_eq!(verified.claims.phone, "+919876543210");
        assert_eq!(verified.realm, Realm::Production);
    }

    #[test]
    fn test_two_tokens_for_same_admin_differ() {
        let (svc, _) = service(AuthMode::Strict);
        let admin = admin("+919876543210");
        assert_ne!(svc.issue(&admin).unwrap(), svc.issue(&admin).unwrap());
    }

    #[test]
    fn test_expired_is_distinct_from_invalid() {
        let (svc, clock) = service(AuthMode::Strict);
        let token = svc.issue(&admin("+919876543210")).unwrap();

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        assert_eq!(svc.verify(&token).unwrap_err(), TokenError::Expired);
        assert!(matches!(
            svc.verify("not.a.token").unwrap_err(),
            TokenError::Invalid(_)
        ));
        assert_eq!(
            SecurityError::from(TokenError::Expired),
            SecurityError::TokenExpired
        );
    }

    #[test]
    fn test_dev_phone_selects_development_realm() {
        let (svc, _) = service(AuthMode::Strict);
        let token = svc.issue(&admin(DEV_PHONE)).unwrap();
        assert_eq!(svc.verify(&token).unwrap().realm, Realm::Development);
    }

    #[test]
    fn test_strict_mode_checks_audience() {
        let (svc, clock) = service(AuthMode::Strict);
        let now = clock.now().timestamp();
        let claims = Claims {
            sub: "x".into(),
            phone: "+919876543210".into(),
            role: "admin".into(),
            iat: now,
            exp: now + 600,
            iss: Some("propdesk".into()),
            aud: Some("someone-else".into()),
            jti: "j".into(),
        };
        let token = sign(&claims, SECRET);
        assert!(matches!(svc.verify(&token), Err(TokenError::Invalid(_))));

        let (lenient, _) = service(AuthMode::Lenient);
        assert!(lenient.verify(&token).is_ok());
    }

    #[test]
    fn test_fallback_secret_only_for_development_realm() {
        let (strict, clock) = service(AuthMode::Strict);
        let (lenient, _) = service(AuthMode::Lenient);
        let now = clock.now().timestamp();
        let mut claims = Claims {
            sub: "x".into(),
            phone: DEV_PHONE.into(),
            role: "admin".into(),
            iat: now,
            exp: now + 600,
            iss: None,
            aud: None,
            jti: "j".into(),
        };

        let dev_token = sign(&claims, DEV_SECRET);
        assert!(strict.verify(&dev_token).is_err());
        assert_eq!(
            lenient.verify(&dev_token).unwrap().realm,
            Realm::Development
        );

        claims.phone = "+919876543210".into();
        let prod_token = sign(&claims, DEV_SECRET);
        assert!(matches!(
            lenient.verify(&prod_token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        let hash = hash_token("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
