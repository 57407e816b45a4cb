//! The capability to authenticate outgoing requests

use std::sync::Arc;

use async_trait::async_trait;
use cloudiam_clock::{Clock, System};
use reqwest::{
    header::{self, HeaderValue},
    Request,
};

use crate::{
    credential::{ClientCredentials, ConfigError, IamConfig},
    error::TokenRequestError,
    issuer::{ReqwestIssuer, TokenIssuer},
    request::ClientAuthenticator,
    AccessTokenRef, ApiKey, Credential, IamTokenSource,
};

/// Something that can authenticate an outgoing request
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Attaches authentication to `request`
    async fn authenticate(&self, request: &mut Request) -> Result<(), TokenRequestError>;
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    async fn authenticate(&self, request: &mut Request) -> Result<(), TokenRequestError> {
        (**self).authenticate(request).await
    }
}

#[async_trait]
impl Authenticator for ClientAuthenticator {
    async fn authenticate(&self, request: &mut Request) -> Result<(), TokenRequestError> {
        self.apply(request.headers_mut());
        Ok(())
    }
}

/// Authenticates requests with IAM access tokens obtained from an API key
///
/// Tokens are cached and refreshed by the wrapped [`IamTokenSource`].
#[derive(Debug)]
pub struct IamAuthenticator<I = ReqwestIssuer, C = System> {
    token_source: IamTokenSource<I, C>,
}

impl IamAuthenticator {
    /// Constructs an authenticator for `api_key` against the default IAM endpoint
    pub fn new(api_key: ApiKey) -> Result<Self, ConfigError> {
        Self::with_credential(Credential::new(api_key)?)
    }

    /// Constructs an authenticator whose token requests are signed with
    /// client credentials
    pub fn with_client_credentials(
        api_key: ApiKey,
        credentials: ClientCredentials,
    ) -> Result<Self, ConfigError> {
        Self::with_credential(Credential::new(api_key)?.with_client_credentials(credentials))
    }

    /// Constructs an authenticator for a fully specified credential
    pub fn with_credential(credential: Credential) -> Result<Self, ConfigError> {
        let issuer = ReqwestIssuer::with_default_client()?;
        Ok(Self::from_token_source(IamTokenSource::new(issuer, credential)))
    }

    /// Constructs an authenticator from deserialized configuration
    pub fn from_config(config: IamConfig) -> Result<Self, ConfigError> {
        let issuer = if config.disable_ssl_verification {
            insecure_issuer()?
        } else {
            ReqwestIssuer::with_default_client()?
        };
        let credential = config.into_credential()?;
        Ok(Self::from_token_source(IamTokenSource::new(issuer, credential)))
    }
}

#[cfg(any(feature = "rustls-tls", feature = "default-tls"))]
fn insecure_issuer() -> Result<ReqwestIssuer, ConfigError> {
    ReqwestIssuer::insecure()
}

// Without a TLS backend there is no certificate verification to disable.
#[cfg(not(any(feature = "rustls-tls", feature = "default-tls")))]
fn insecure_issuer() -> Result<ReqwestIssuer, ConfigError> {
    ReqwestIssuer::with_default_client()
}

impl<I, C> IamAuthenticator<I, C> {
    /// Constructs an authenticator backed by an existing token source
    pub fn from_token_source(token_source: IamTokenSource<I, C>) -> Self {
        Self { token_source }
    }

    /// Gets the underlying token source
    pub fn token_source(&self) -> &IamTokenSource<I, C> {
        &self.token_source
    }
}

impl<I, C> Clone for IamAuthenticator<I, C> {
    fn clone(&self) -> Self {
        Self {
            token_source: self.token_source.clone(),
        }
    }
}

#[async_trait]
impl<I, C> Authenticator for IamAuthenticator<I, C>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn authenticate(&self, request: &mut Request) -> Result<(), TokenRequestError> {
        let token = self.token_source.token().await?;
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, bearer_header(&token)?);
        Ok(())
    }
}

fn bearer_header(token: &AccessTokenRef) -> Result<HeaderValue, TokenRequestError> {
    let mut value = HeaderValue::try_from(format!("Bearer {}", token.as_str()))
        .map_err(TokenRequestError::transport)?;
    value.set_sensitive(true);
    Ok(value)
}
