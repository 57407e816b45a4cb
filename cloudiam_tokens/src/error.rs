//! Errors produced while obtaining tokens

use std::{error, sync::Arc};

use cloudiam_clock::UnixTime;
use reqwest::StatusCode;
use thiserror::Error;

/// An error while attempting to obtain a token from the issuer
///
/// Errors are cheap to clone so that a single failed fetch can be reported to
/// every caller waiting on it.
#[derive(Clone, Debug, Error)]
pub enum TokenRequestError {
    /// The issuer could not be reached or the response could not be read
    #[error("error communicating with token issuer")]
    Transport(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The issuer answered with a non-success status, or with a body that is
    /// not a token response
    #[error("token issuer rejected request with status {status}: {message}")]
    Rejected {
        /// The HTTP status returned by the issuer
        status: StatusCode,
        /// A human-readable description of the failure
        message: String,
        /// The response payload, for diagnostics
        metadata: ResponsePayload,
    },
    /// The issuer returned a token that had already expired when received
    #[error("token issuer returned a token that expired at {expiry:?}")]
    AlreadyExpired {
        /// The expiry reported for the token
        expiry: UnixTime,
    },
    /// The fetch ended without producing a result
    #[error("token request was interrupted before completing")]
    Interrupted,
}

impl TokenRequestError {
    /// Wraps a transport-level failure
    pub fn transport<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(error))
    }

    /// The HTTP status reported by the issuer, if the issuer answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Transport(_) | Self::AlreadyExpired { .. } | Self::Interrupted => None,
        }
    }
}

/// The body of an issuer response kept for diagnostics
#[derive(Clone, Debug, PartialEq)]
pub enum ResponsePayload {
    /// The body parsed as JSON
    Json(serde_json::Value),
    /// The body as received, when it is not JSON
    Raw(String),
}

impl ResponsePayload {
    fn from_body(body: &[u8]) -> Self {
        serde_json::from_slice(body)
            .map(Self::Json)
            .unwrap_or_else(|_| Self::Raw(String::from_utf8_lossy(body).into_owned()))
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_ascii_lowercase()
}

/// Builds the error for a non-success issuer response
///
/// The message is taken from the `errorMessage` field of a JSON body when
/// present, otherwise it is the standard reason phrase for `status`.
pub fn decode_error_response(status: StatusCode, body: &[u8]) -> TokenRequestError {
    let metadata = ResponsePayload::from_body(body);

    let message = match &metadata {
        ResponsePayload::Json(json) => json
            .get("errorMessage")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned),
        ResponsePayload::Raw(_) => None,
    }
    .unwrap_or_else(|| reason_phrase(status));

    TokenRequestError::Rejected {
        status,
        message,
        metadata,
    }
}

/// Builds the error for a success response whose body is not a token
pub(crate) fn undecodable_token_response(status: StatusCode, body: &[u8]) -> TokenRequestError {
    TokenRequestError::Rejected {
        status,
        message: reason_phrase(status),
        metadata: ResponsePayload::from_body(body),
    }
}
