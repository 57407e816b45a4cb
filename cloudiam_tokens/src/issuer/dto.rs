//! DTOs for interacting with the IAM token endpoint

use cloudiam_clock::{DurationSecs, UnixTime};
use serde::Deserialize;

use crate::{AccessToken, IssuedToken};

/// A successful token response
///
/// Only `access_token` and the expiry are consumed; the remaining fields are
/// accepted so that well-formed responses always decode.
#[derive(Debug, Deserialize)]
pub struct IamTokenResponse {
    /// The bearer access token
    pub access_token: AccessToken,
    /// A refresh token, unused by the API key flow
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// The token type, usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the token expires, relative to issuance
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    /// The instant the token expires
    #[serde(default)]
    pub expiration: Option<UnixTime>,
}

impl IamTokenResponse {
    /// Normalizes the response into a token with an absolute expiry
    ///
    /// `expiration` is preferred. When only `expires_in` is present, it is
    /// taken relative to `now`. A response with neither cannot be used.
    pub fn into_issued(self, now: UnixTime) -> Option<IssuedToken> {
        let expiry = self
            .expiration
            .or_else(|| self.expires_in.map(|lifetime| now + lifetime))?;

        Some(IssuedToken {
            access_token: self.access_token,
            expiry,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_owned()),
        })
    }
}
