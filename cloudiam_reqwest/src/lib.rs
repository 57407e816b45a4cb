//! Middleware to automatically attach IAM authorization to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthenticatorMiddleware`] in the middleware stack to have
//! every outbound request authenticated by an
//! [`Authenticator`](cloudiam_tokens::Authenticator), typically an
//! [`IamAuthenticator`](cloudiam_tokens::IamAuthenticator) backed by a cached
//! token source.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use cloudiam_reqwest::AuthenticatorMiddleware;
//! use cloudiam_tokens::{ApiKey, IamAuthenticator};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let authenticator = IamAuthenticator::new(ApiKey::from_static("my-api-key")).unwrap();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthenticatorMiddleware::new(authenticator))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! A failure to authenticate a request is reported as
//! [`Error::Middleware`](reqwest_middleware::Error::Middleware) and the
//! request is not sent.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use cloudiam_tokens::Authenticator;
use reqwest::{header, Request, Response};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that authenticates outgoing requests
#[derive(Clone, Debug)]
pub struct AuthenticatorMiddleware<A> {
    authenticator: A,
}

impl<A> AuthenticatorMiddleware<A> {
    /// Construct a new middleware from an authenticator
    pub fn new(authenticator: A) -> Self {
        Self { authenticator }
    }

    /// Gets the authenticator used by this middleware
    pub fn authenticator(&self) -> &A {
        &self.authenticator
    }
}

#[async_trait::async_trait]
impl<A> Middleware for AuthenticatorMiddleware<A>
where
    A: Authenticator + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already carries authorization, leaving as is");
        } else {
            self.authenticator
                .authenticate(&mut req)
                .await
                .map_err(|error| {
                    tracing::debug!(%error, "unable to authenticate outgoing request");
                    Error::middleware(error)
                })?;
        }

        next.run(req, extensions).await
    }
}
