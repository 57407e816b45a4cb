use async_trait::async_trait;
use cloudiam_clock::{Clock, System};

use super::{dto::IamTokenResponse, TokenIssuer};
use crate::{
    credential::ConfigError,
    error::{decode_error_response, undecodable_token_response, TokenRequestError},
    request::TokenRequest,
    IssuedToken,
};

/// An issuer that talks to an IAM token endpoint over HTTP
#[derive(Clone, Debug)]
pub struct ReqwestIssuer<C = System> {
    client: reqwest::Client,
    clock: C,
}

impl ReqwestIssuer<System> {
    /// Constructs an issuer using the provided HTTP client
    ///
    /// Timeouts configured on `client` bound how long a fetch may occupy the
    /// token source's fetch lane.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            clock: System,
        }
    }

    /// Constructs an issuer with a default HTTP client
    pub fn with_default_client() -> Result<Self, ConfigError> {
        Ok(Self::new(reqwest::Client::builder().build()?))
    }

    /// Constructs an issuer that does not verify the issuer's TLS certificate
    ///
    /// **Important**: only use this against test endpoints. It allows anyone
    /// able to intercept traffic to capture the API key.
    #[cfg(any(feature = "rustls-tls", feature = "default-tls"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "rustls-tls", feature = "default-tls"))))]
    pub fn insecure() -> Result<Self, ConfigError> {
        tracing::warn!("TLS certificate verification disabled for token requests");
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self::new(client))
    }
}

impl<C> ReqwestIssuer<C> {
    /// Sets a custom clock, used to normalize relative expiry times
    pub fn with_clock<D>(self, clock: D) -> ReqwestIssuer<D> {
        ReqwestIssuer {
            client: self.client,
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenIssuer for ReqwestIssuer<C> {
    async fn issue(&self, request: TokenRequest) -> Result<IssuedToken, TokenRequestError> {
        request_token(&self.client, request, &self.clock).await
    }
}

#[tracing::instrument(
    err,
    skip(client, request, clock),
    fields(token_url = %request.url),
)]
async fn request_token<C: Clock>(
    client: &reqwest::Client,
    request: TokenRequest,
    clock: &C,
) -> Result<IssuedToken, TokenRequestError> {
    tracing::trace!("requesting token from issuer");

    let resp = client
        .request(request.method, request.url)
        .headers(request.headers)
        .body(request.body)
        .send()
        .await
        .map_err(TokenRequestError::transport)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuer"
    );

    let body = resp.bytes().await.map_err(TokenRequestError::transport)?;

    if !status.is_success() {
        return Err(decode_error_response(status, &body));
    }

    let token = serde_json::from_slice::<IamTokenResponse>(&body)
        .ok()
        .and_then(|resp| resp.into_issued(clock.now()))
        .ok_or_else(|| undecodable_token_response(status, &body))?;

    tracing::debug!(
        token.expiry = token.expiry.0,
        token_type = %token.token_type,
        "decoded token response"
    );

    Ok(token)
}
