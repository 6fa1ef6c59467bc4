//! Access tokens for directory and cloud calls.
//!
//! The caller supplies a `TokenProvider`; the manager asks it for a token
//! before every authenticated collaborator call. Token issuance itself (JWT
//! signing etc.) lives outside this crate.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crypto::generate_random_bytes;
use crate::types::TokenError;

/// Which collaborator the token will be presented to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenService {
    Directory,
    Cloud,
}

/// Context passed to the token provider for each request
#[derive(Debug, Clone)]
pub struct TokenContext {
    pub identity: String,
    pub service: TokenService,
    pub operation: &'static str,
}

/// A signed access token bound to one identity
#[derive(Debug, Clone)]
pub struct AccessToken {
    identity: String,
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(
        identity: impl Into<String>,
        value: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            identity: identity.into(),
            value: value.into(),
            expires_at,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Supplies access tokens; failures propagate to the caller unchanged.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, context: &TokenContext) -> Result<AccessToken, TokenError>;
}

/// Issues short-lived opaque tokens for a single identity.
///
/// Suitable for the bundled in-memory collaborators and the CLI sandbox.
pub struct LocalTokenProvider {
    identity: String,
    ttl: Duration,
}

impl LocalTokenProvider {
    pub fn new(identity: impl Into<String>, ttl: Duration) -> Self {
        Self {
            identity: identity.into(),
            ttl,
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for LocalTokenProvider {
    async fn get_token(&self, context: &TokenContext) -> Result<AccessToken, TokenError> {
        if context.identity != self.identity {
            return Err(TokenError(format!(
                "provider issues tokens for {}, not {}",
                self.identity, context.identity
            )));
        }

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| TokenError(format!("invalid token ttl: {e}")))?;

        Ok(AccessToken::new(
            self.identity.clone(),
            hex::encode(generate_random_bytes::<16>()),
            Some(Utc::now() + ttl),
        ))
    }
}
