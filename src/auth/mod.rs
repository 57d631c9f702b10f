//! Bearer-token authentication.
//!
//! Tokens are issued by an external identity provider and signed with a
//! shared HS256 secret; this service only verifies them.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{errors::ServiceError, AppState};

pub const ADMIN_ROLE: &str = "admin";

/// JWT claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "admin role required for this operation".to_string(),
            ))
        }
    }

    /// Owner id to scope order lookups by; admins see every order.
    pub fn owner_scope(&self) -> Option<Uuid> {
        if self.is_admin() {
            None
        } else {
            Some(self.user_id)
        }
    }
}

impl TryFrom<Claims> for AuthUser {
    type Error = AuthError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidSubject)?;
        Ok(Self {
            user_id,
            name: claims.name,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token subject is not a valid user id")]
    InvalidSubject,
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        ServiceError::Unauthorized(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

/// Verifies HS256 tokens against the configured issuer and audience
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!(error = %e, "token rejected");
                    AuthError::InvalidToken
                }
            })?
            .claims;
        AuthUser::try_from(claims)
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        state.jwt.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit_test_secret_that_is_long_enough_123";

    fn token(sub: &str, roles: &[&str], exp_offset: i64, aud: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            name: None,
            email: Some("buyer@example.com".into()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: now,
            exp: now + exp_offset,
            iss: "storefront-auth".into(),
            aud: aud.into(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(SECRET, "storefront-auth", "storefront-api")
    }

    #[test]
    fn verifies_valid_token() {
        let id = Uuid::new_v4();
        let user = verifier()
            .verify(&token(&id.to_string(), &["admin"], 600, "storefront-api"))
            .unwrap();
        assert_eq!(user.user_id, id);
        assert!(user.is_admin());
        assert_eq!(user.owner_scope(), None);
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(
            verifier()
                .verify(&token(&id, &[], -3600, "storefront-api"))
                .unwrap_err(),
            AuthError::TokenExpired
        );
        assert_eq!(
            verifier()
                .verify(&token(&id, &[], 600, "someone-else"))
                .unwrap_err(),
            AuthError::InvalidToken
        );
        assert_eq!(
            verifier()
                .verify(&token("not-a-uuid", &[], 600, "storefront-api"))
                .unwrap_err(),
            AuthError::InvalidSubject
        );
    }

    #[test]
    fn customers_are_scoped_to_their_orders() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            name: None,
            email: None,
            roles: vec!["customer".into()],
        };
        assert_eq!(user.owner_scope(), Some(user.user_id));
        assert!(user.require_admin().is_err());
    }
}
