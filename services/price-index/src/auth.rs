//! Channel authentication
//!
//! Authentication is per channel, not per connection: a connection that
//! never authenticates keeps full access to public channels.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::broadcaster::Channel;
use crate::error::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Identity established by a successful `auth` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// HS256 bearer tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(Principal {
            subject: data.claims.sub,
        })
    }
}

/// Why a subscription to `channel` is refused, if it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    AuthenticationRequired,
    Forbidden,
}

/// Authorization check at the subscription boundary.
pub fn authorize(channel: &Channel, principal: Option<&Principal>) -> Result<(), Denial> {
    if !channel.is_protected() {
        return Ok(());
    }
    let Some(principal) = principal else {
        return Err(Denial::AuthenticationRequired);
    };
    match channel {
        Channel::UserAlerts(user) if *user != principal.subject => Err(Denial::Forbidden),
        _ => Ok(()),
    }
}
