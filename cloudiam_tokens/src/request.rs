//! Construction of the token request sent to the issuer

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Method, Url,
};

use crate::{credential::ClientCredentials, Credential};

/// The grant type for exchanging an API key
pub const GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// The response type requested from the issuer
pub const RESPONSE_TYPE: &str = "cloud_iam";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_ACCEPT: &str = "application/json";

/// A fully formed token request, ready to hand to a transport
#[derive(Clone, Debug)]
pub struct TokenRequest {
    /// The HTTP method
    pub method: Method,
    /// The issuer URL
    pub url: Url,
    /// The request headers
    pub headers: HeaderMap,
    /// The form-encoded request body
    pub body: String,
}

/// Authentication applied to the token request itself
///
/// Only authenticators that do not depend on a token source are
/// representable, so a token source can never be asked to authenticate its
/// own fetch.
#[derive(Clone, Debug, Default)]
pub enum ClientAuthenticator {
    /// The token request carries no client authentication
    #[default]
    NoAuth,
    /// The token request is authenticated with HTTP basic credentials
    Basic(ClientCredentials),
}

impl ClientAuthenticator {
    /// Adds this authenticator's `Authorization` header to `headers`, if any
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Self::Basic(credentials) = self {
            headers.insert(header::AUTHORIZATION, basic_auth_header(credentials));
        }
    }
}

pub(crate) fn basic_auth_header(credentials: &ClientCredentials) -> HeaderValue {
    let encoded = STANDARD.encode(format!(
        "{}:{}",
        credentials.client_id.as_str(),
        credentials.client_secret.as_str()
    ));
    let mut value = HeaderValue::try_from(format!("Basic {}", encoded))
        .expect("only valid header bytes");
    value.set_sensitive(true);
    value
}

/// Builds the request exchanging `credential`'s API key for a token
///
/// `Content-Type` and `Accept` are always the form and JSON types; any other
/// header configured on the credential is merged in unless the builder
/// already set it.
pub fn build_token_request(credential: &Credential) -> TokenRequest {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(FORM_CONTENT_TYPE),
    );
    headers.insert(header::ACCEPT, HeaderValue::from_static(JSON_ACCEPT));
    if let Some(user_agent) = credential.user_agent() {
        headers.insert(header::USER_AGENT, user_agent.clone());
    }

    for (name, value) in credential.headers() {
        headers
            .entry(name)
            .or_insert_with(|| value.clone());
    }

    credential.client_auth().apply(&mut headers);

    let body = [
        format!("grant_type={}", GRANT_TYPE),
        format!("apikey={}", credential.api_key().as_str()),
        format!("response_type={}", RESPONSE_TYPE),
    ]
    .join("&");

    TokenRequest {
        method: Method::POST,
        url: credential.url().clone(),
        headers,
        body,
    }
}
