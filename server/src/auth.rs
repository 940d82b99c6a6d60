//! External identity issuer interface
//!
//! Credential validation is owned by an external collaborator; the
//! coordinator only consumes the verified identity it returns. Connections
//! presenting no credential stay in a degraded ping/pong-only mode and are
//! never registered by identity.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Player,
    Admin,
}

/// A verified identity as returned by the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("identity issuer unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityIssuer: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Development issuer that derives the identity from the token itself.
/// Stands in for the real issuer in local runs and tests only.
pub struct LocalIssuer;

#[async_trait]
impl IdentityIssuer for LocalIssuer {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        Ok(Identity {
            user_id: token.to_string(),
            display_name: token.to_string(),
            role: Role::Player,
        })
    }
}
