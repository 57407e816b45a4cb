use cloudiam_clock::{DurationSecs, UnixTime};

use crate::AccessToken;

/// Portion of a token's remaining lifetime, measured when the token is
/// stored, that is reserved for proactive renewal before expiry
///
/// A token that has 10 minutes left when it is received becomes due for
/// refresh 2 minutes before it expires.
pub const REFRESH_BUFFER_RATIO: f64 = 0.2;

/// Delay applied to the refresh instant while a background refresh is
/// outstanding, so that callers during that window do not request another
pub const REFRESH_DEBOUNCE: DurationSecs = DurationSecs(60);

/// A token as returned by the issuer, with its expiry normalized to an
/// absolute instant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    /// The bearer access token
    pub access_token: AccessToken,
    /// The instant at which the token stops being valid
    pub expiry: UnixTime,
    /// The token type reported by the issuer, usually `Bearer`
    pub token_type: String,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// No token has been obtained yet, or the last fetch failed
    Empty,
    /// The token is valid and not yet due for refresh
    Fresh,
    /// The token is valid, but a background refresh should be attempted
    RefreshDue,
    /// The token is no longer valid and will not be handed out
    Expired,
}

/// The cached token along with the instants that govern its use
#[derive(Clone, Debug)]
pub struct CachedToken {
    access_token: AccessToken,
    expiry: UnixTime,
    refresh_at: UnixTime,
}

impl CachedToken {
    /// Caches a freshly issued token, scheduling its refresh relative to `now`
    pub(crate) fn schedule(token: IssuedToken, now: UnixTime) -> Self {
        Self {
            access_token: token.access_token,
            expiry: token.expiry,
            refresh_at: refresh_instant(token.expiry, now),
        }
    }

    /// Pushes the refresh instant out by the debounce window, never past expiry
    pub(crate) fn debounced(&self, now: UnixTime) -> Self {
        self.with_refresh_at((now + REFRESH_DEBOUNCE).min(self.expiry))
    }

    pub(crate) fn with_refresh_at(&self, refresh_at: UnixTime) -> Self {
        Self {
            access_token: self.access_token.clone(),
            expiry: self.expiry,
            refresh_at: refresh_at.min(self.expiry),
        }
    }

    /// Gets the cached access token
    #[inline]
    pub fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the time at which a background refresh becomes due
    #[inline]
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn status_at(&self, time: UnixTime) -> TokenStatus {
        if time >= self.expiry {
            TokenStatus::Expired
        } else if time >= self.refresh_at {
            TokenStatus::RefreshDue
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry - time
    }
}

/// Computes when a token expiring at `expiry` should be refreshed
///
/// The buffer is [`REFRESH_BUFFER_RATIO`] of the lifetime remaining at `now`.
/// A token that is already expired is due immediately.
pub fn refresh_instant(expiry: UnixTime, now: UnixTime) -> UnixTime {
    let buffer = (expiry - now) * REFRESH_BUFFER_RATIO;
    expiry - buffer
}
