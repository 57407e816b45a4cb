//! Credentials and configuration for a token source

use std::{collections::BTreeMap, error};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Url,
};
use serde::Deserialize;
use thiserror::Error;

use crate::{request::ClientAuthenticator, ApiKey, ClientId, ClientSecret};

/// The public IAM token endpoint, used when no issuer URL is configured
pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Client credentials used to authenticate the token request itself
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// An error in the configuration of a credential
///
/// These are raised while constructing a token source, never while fetching
/// a token.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key, or an empty one, was provided
    #[error("an API key is required")]
    MissingApiKey,
    /// The issuer URL could not be parsed
    #[error("invalid token issuer URL `{url}`")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        #[source]
        source: Box<dyn error::Error + Send + Sync + 'static>,
    },
    /// Only one of client ID and client secret was provided
    #[error("client ID and client secret must be provided together")]
    IncompleteClientCredentials,
    /// A configured header name or value is not valid in HTTP
    #[error("invalid header `{name}`")]
    InvalidHeader {
        /// The rejected header name
        name: String,
        /// Why it was rejected
        #[source]
        source: Box<dyn error::Error + Send + Sync + 'static>,
    },
    /// The HTTP client used to reach the issuer could not be built
    #[error("unable to construct HTTP client")]
    HttpClient(#[from] reqwest::Error),
}

/// The long-lived credential exchanged for access tokens
///
/// A credential is immutable once handed to a token source.
#[derive(Clone, Debug)]
pub struct Credential {
    api_key: ApiKey,
    url: Url,
    client_auth: ClientAuthenticator,
    headers: HeaderMap,
    user_agent: Option<HeaderValue>,
}

impl Credential {
    /// Constructs a credential for `api_key` against the default IAM endpoint
    pub fn new(api_key: ApiKey) -> Result<Self, ConfigError> {
        if api_key.as_str().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        Ok(Self {
            api_key,
            url: parse_url(DEFAULT_IAM_URL)?,
            client_auth: ClientAuthenticator::NoAuth,
            headers: HeaderMap::new(),
            user_agent: None,
        })
    }

    /// Sets the token issuer URL
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// Authenticates token requests with HTTP basic client credentials
    pub fn with_client_credentials(mut self, credentials: ClientCredentials) -> Self {
        self.client_auth = ClientAuthenticator::Basic(credentials);
        self
    }

    /// Adds a header to send with every token request
    ///
    /// Headers set by the request builder itself take precedence.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the `User-Agent` sent with token requests
    pub fn with_user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    /// Gets the API key
    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    /// Gets the token issuer URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Gets the authenticator applied to token requests
    pub fn client_auth(&self) -> &ClientAuthenticator {
        &self.client_auth
    }

    /// Gets the additional headers sent with token requests
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Gets the configured `User-Agent`, if any
    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.user_agent.as_ref()
    }
}

fn parse_url(url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
        url: url.to_owned(),
        source: source.into(),
    })
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|source| ConfigError::InvalidHeader {
        name: name.to_owned(),
        source: source.into(),
    })
}

/// Serializable configuration for an IAM token source
///
/// Field names follow the conventional credential-file keys, so the record
/// can be deserialized from whatever configuration format the application
/// uses.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct IamConfig {
    /// The API key to exchange for tokens
    pub apikey: Option<ApiKey>,
    /// The token issuer URL; defaults to [`DEFAULT_IAM_URL`]
    #[serde(alias = "auth_url")]
    pub url: Option<String>,
    /// Client ID for authenticating token requests
    pub client_id: Option<ClientId>,
    /// Client secret for authenticating token requests
    pub client_secret: Option<ClientSecret>,
    /// Additional headers to send with token requests
    pub headers: BTreeMap<String, String>,
    /// The `User-Agent` to send with token requests
    pub user_agent: Option<String>,
    /// Skips verification of the issuer's TLS certificate
    ///
    /// Only to be used against test endpoints.
    pub disable_ssl_verification: bool,
}

impl IamConfig {
    /// Validates the configuration and converts it into a credential
    pub fn into_credential(self) -> Result<Credential, ConfigError> {
        let api_key = self.apikey.ok_or(ConfigError::MissingApiKey)?;
        let mut credential = Credential::new(api_key)?;

        if let Some(url) = self.url {
            credential = credential.with_url(parse_url(&url)?);
        }

        match (self.client_id, self.client_secret) {
            (Some(client_id), Some(client_secret)) => {
                credential = credential.with_client_credentials(ClientCredentials {
                    client_id,
                    client_secret,
                });
            }
            (None, None) => {}
            _ => return Err(ConfigError::IncompleteClientCredentials),
        }

        for (name, value) in &self.headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
                    ConfigError::InvalidHeader {
                        name: name.clone(),
                        source: source.into(),
                    }
                })?;
            credential = credential.with_header(header_name, header_value(name, value)?);
        }

        if let Some(user_agent) = self.user_agent {
            credential = credential.with_user_agent(header_value("user-agent", &user_agent)?);
        }

        Ok(credential)
    }
}
