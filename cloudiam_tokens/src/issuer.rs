//! Token issuers

use async_trait::async_trait;
use cloudiam_clock::{Clock, DurationSecs, System};

use crate::{error::TokenRequestError, request::TokenRequest, AccessToken, IssuedToken};

pub mod dto;
mod iam;

pub use iam::ReqwestIssuer;

/// A transport that exchanges a token request for a token
///
/// Implementations perform a single attempt per call; retries are left to
/// callers.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Sends `request` to the issuer and decodes the issued token
    async fn issue(&self, request: TokenRequest) -> Result<IssuedToken, TokenRequestError>;
}

/// An issuer that hands out the same access token every time
///
/// Each issued token expires `lifetime` after it is issued. Useful for demos
/// and for testing the layers above a token source.
#[derive(Debug)]
pub struct StaticIssuer<C = System> {
    access_token: AccessToken,
    lifetime: DurationSecs,
    clock: C,
}

impl StaticIssuer<System> {
    /// Constructs an issuer whose tokens live for one hour
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
            lifetime: DurationSecs(3600),
            clock: System,
        }
    }
}

impl<C> StaticIssuer<C> {
    /// Sets the lifetime of issued tokens
    pub fn with_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets a custom clock to be used
    pub fn with_clock<D>(self, clock: D) -> StaticIssuer<D> {
        StaticIssuer {
            access_token: self.access_token,
            lifetime: self.lifetime,
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenIssuer for StaticIssuer<C> {
    async fn issue(&self, _: TokenRequest) -> Result<IssuedToken, TokenRequestError> {
        Ok(IssuedToken {
            access_token: self.access_token.clone(),
            expiry: self.clock.now() + self.lifetime,
            token_type: "Bearer".to_owned(),
        })
    }
}
