//! Cached, self-refreshing access tokens for IAM API keys
//!
//! Services authenticated by IAM expect a short-lived bearer access token on
//! every request. Exchanging the long-lived API key for such a token costs a
//! round trip to the IAM token endpoint, so this crate keeps the most recent
//! token around and hands it out for as long as it remains valid.
//!
//! Consumers interact with an [`IamTokenSource`]. A call to
//! [`token()`][IamTokenSource::token] returns immediately when a usable token
//! is cached. When the token is approaching expiry, the caller still receives
//! it straight away while a replacement is requested in the background. Only
//! when there is no usable token at all does the caller wait on the issuer,
//! and concurrent callers in that position share a single request.
//!
//! ```
//! use cloudiam_tokens::{issuer::ReqwestIssuer, ApiKey, Credential, IamTokenSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = Credential::new(ApiKey::from_static("my-api-key"))?;
//! let issuer = ReqwestIssuer::with_default_client()?;
//! let source = IamTokenSource::new(issuer, credential);
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = source.token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "obtained access token");
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! # Token lifecycle
//!
//! A freshly issued token is scheduled for refresh once 80% of its remaining
//! lifetime has elapsed. See [`REFRESH_BUFFER_RATIO`]. After a background
//! refresh has been started, further refreshes are held off for
//! [`REFRESH_DEBOUNCE`] so that a slow issuer is not flooded with requests.
//! An expired token is never handed out.
//!
//! # Authenticating requests
//!
//! The [`Authenticator`] trait abstracts over the ways a request may be
//! authenticated. [`IamAuthenticator`] attaches a bearer token from a token
//! source. [`ClientAuthenticator`] covers the no-op and basic schemes used to
//! authenticate the token request itself.
//!
//! # Features
//!
//! * `rustls-tls` (default): use rustls as the TLS backend for token requests.
//! * `default-tls`: use the platform's native TLS backend.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authenticator;
mod braids;
mod credential;
pub mod error;
pub mod issuer;
pub mod request;
mod token_source;
mod tokens;

pub use authenticator::{Authenticator, IamAuthenticator};
pub use braids::*;
pub use credential::{ClientCredentials, ConfigError, Credential, IamConfig, DEFAULT_IAM_URL};
pub use error::TokenRequestError;
pub use request::ClientAuthenticator;
pub use token_source::IamTokenSource;
pub use tokens::{
    refresh_instant, CachedToken, IssuedToken, TokenStatus, REFRESH_BUFFER_RATIO,
    REFRESH_DEBOUNCE,
};
