//! A cached token source with coalesced fetches and background refresh

use std::{error, fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use cloudiam_clock::{Clock, System};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::TokenRequestError, issuer::TokenIssuer, request::build_token_request, AccessToken,
    CachedToken, Credential, IssuedToken, TokenStatus,
};

type SharedFetch = Shared<BoxFuture<'static, Result<AccessToken, TokenRequestError>>>;

/// A source of access tokens for a single credential
///
/// The first request for a token fetches one from the issuer. Until that token
/// expires, it is handed out without any network activity. Once the token
/// becomes due for refresh, the caller still receives the current token
/// immediately while a replacement is requested in the background.
///
/// At most one fetch and at most one refresh are in flight at any time.
/// Callers that arrive while a fetch is outstanding wait on that fetch and
/// all receive its outcome.
///
/// Cloning the source is cheap; clones share the same cached token.
pub struct IamTokenSource<I, C = System> {
    inner: Arc<Inner<I, C>>,
}

struct Inner<I, C> {
    issuer: I,
    credential: Credential,
    clock: C,
    state: ArcSwapOption<CachedToken>,
    fetch_lane: Mutex<Option<SharedFetch>>,
    refresh_lane: Arc<Mutex<()>>,
}

impl<I> IamTokenSource<I, System>
where
    I: TokenIssuer + 'static,
{
    /// Constructs a token source exchanging `credential` through `issuer`
    pub fn new(issuer: I, credential: Credential) -> Self {
        Self::new_with_clock(issuer, credential, System)
    }
}

impl<I, C> IamTokenSource<I, C>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a token source using the given clock
    pub fn new_with_clock(issuer: I, credential: Credential, clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                credential,
                clock,
                state: ArcSwapOption::empty(),
                fetch_lane: Mutex::new(None),
                refresh_lane: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Gets a valid access token
    ///
    /// Returns without suspending when a valid token is cached. Otherwise
    /// waits for a fetch from the issuer, joining one already in flight.
    ///
    /// Must be called from within a Tokio runtime, as fetches and refreshes
    /// run as spawned tasks.
    pub async fn token(&self) -> Result<AccessToken, TokenRequestError> {
        if let Some(token) = self.inner.usable_token() {
            return Ok(token);
        }

        let inflight = {
            let mut lane = self.inner.fetch_lane.lock().await;

            // A fetch may have completed while waiting for the lane
            if let Some(token) = self.inner.usable_token() {
                return Ok(token);
            }

            match &*lane {
                Some(inflight) => {
                    tracing::trace!("joining in-flight token fetch");
                    inflight.clone()
                }
                None => {
                    let inflight = Inner::start_fetch(&self.inner);
                    *lane = Some(inflight.clone());
                    inflight
                }
            }
        };

        inflight.await
    }

    /// Gets the token's current lifecycle status
    pub fn status(&self) -> TokenStatus {
        let now = self.inner.clock.now();
        self.inner
            .state
            .load()
            .as_deref()
            .map_or(TokenStatus::Empty, |cached| cached.status_at(now))
    }

    /// Gets a snapshot of the cached token, if any, including expired ones
    pub fn cached(&self) -> Option<CachedToken> {
        self.inner.state.load_full().map(|cached| (*cached).clone())
    }

    /// Gets the credential this source exchanges
    pub fn credential(&self) -> &Credential {
        &self.inner.credential
    }
}

impl<I, C> Inner<I, C>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Returns the cached token if it has not expired, kicking off a
    /// background refresh if one is due
    fn usable_token(self: &Arc<Self>) -> Option<AccessToken> {
        let now = self.clock.now();
        let guard = self.state.load();
        let cached = guard.as_deref()?;

        match cached.status_at(now) {
            TokenStatus::Fresh => Some(cached.access_token().clone()),
            TokenStatus::RefreshDue => {
                self.trigger_refresh();
                Some(cached.access_token().clone())
            }
            TokenStatus::Expired | TokenStatus::Empty => {
                tracing::trace!(expiry = cached.expiry().0, "cached token has expired");
                None
            }
        }
    }

    fn trigger_refresh(self: &Arc<Self>) {
        let Ok(lane) = Arc::clone(&self.refresh_lane).try_lock_owned() else {
            tracing::trace!("token refresh already in progress");
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.refresh(lane).await });
    }

    fn start_fetch(self: &Arc<Self>) -> SharedFetch {
        tracing::debug!("fetching new token from issuer");

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = inner
                .issuer
                .issue(build_token_request(&inner.credential))
                .await
                .and_then(|token| inner.store(token));

            if let Err(error) = &result {
                tracing::warn!(
                    error = (error as &dyn error::Error),
                    "unable to fetch token from issuer"
                );
                inner.discard_expired();
            }

            *inner.fetch_lane.lock().await = None;
            result
        });

        let inner = Arc::clone(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    if join_error.is_panic() {
                        tracing::error!("token fetch panicked!");
                    } else {
                        tracing::info!("token fetch was cancelled");
                    }
                    *inner.fetch_lane.lock().await = None;
                    Err(TokenRequestError::Interrupted)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn refresh(self: Arc<Self>, _lane: OwnedMutexGuard<()>) {
        let now = self.clock.now();
        let Some(previous) = self.state.load_full() else {
            return;
        };

        // Another refresh may have completed since this one was triggered
        if !matches!(previous.status_at(now), TokenStatus::RefreshDue) {
            tracing::trace!("token no longer due for refresh");
            return;
        }

        let debounced = Arc::new(previous.debounced(now));
        if !self.replace_if_current(&previous, &debounced) {
            tracing::trace!("token replaced while preparing refresh");
            return;
        }

        tracing::debug!(
            refresh_at = debounced.refresh_at().0,
            "refreshing token in background"
        );

        let result = self
            .issuer
            .issue(build_token_request(&self.credential))
            .await
            .and_then(|token| self.store(token));

        if let Err(error) = result {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "background token refresh failed, keeping current token"
            );

            let retry = Arc::new(debounced.with_refresh_at(previous.refresh_at()));
            self.replace_if_current(&debounced, &retry);
        }
    }

    /// Caches a newly issued token, refusing one that has already expired
    fn store(&self, token: IssuedToken) -> Result<AccessToken, TokenRequestError> {
        let now = self.clock.now();
        let cached = CachedToken::schedule(token, now);

        if cached.expiry() <= now {
            tracing::warn!(
                expiry = cached.expiry().0,
                now = now.0,
                "issuer returned a token that has already expired"
            );
            return Err(TokenRequestError::AlreadyExpired {
                expiry: cached.expiry(),
            });
        }

        tracing::info!(
            lifetime = cached.until_expired_at(now).0,
            refresh_at = cached.refresh_at().0,
            expiry = cached.expiry().0,
            "received new access token"
        );

        let access_token = cached.access_token().clone();
        self.state.store(Some(Arc::new(cached)));
        Ok(access_token)
    }

    /// Resets the state to empty if the cached token is no longer valid
    fn discard_expired(&self) {
        let now = self.clock.now();
        self.state.rcu(|current| match current {
            Some(cached) if cached.status_at(now) == TokenStatus::Expired => None,
            other => other.clone(),
        });
    }

    /// Swaps in `replacement` only if `expected` is still the cached token
    fn replace_if_current(
        &self,
        expected: &Arc<CachedToken>,
        replacement: &Arc<CachedToken>,
    ) -> bool {
        let prior = self.state.rcu(|current| match current {
            Some(cached) if Arc::ptr_eq(cached, expected) => Some(Arc::clone(replacement)),
            other => other.clone(),
        });

        matches!(&prior, Some(cached) if Arc::ptr_eq(cached, expected))
    }
}

impl<I, C> Clone for IamTokenSource<I, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, C> fmt::Debug for IamTokenSource<I, C>
where
    I: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IamTokenSource")
            .field("issuer", &self.inner.issuer)
            .field("credential", &self.inner.credential)
            .field("clock", &self.inner.clock)
            .field("cached", &self.inner.state.load_full())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use cloudiam_clock::{DurationSecs, TestClock, UnixTime};
    use futures::future::join_all;
    use reqwest::StatusCode;

    use super::*;
    use crate::{error::decode_error_response, request::TokenRequest, ApiKey};

    const START: UnixTime = UnixTime(1_000_000);

    enum Reply {
        Token(&'static str, DurationSecs),
        /// A token whose expiry is already five seconds in the past
        Stale(&'static str),
        Reject(StatusCode, &'static str),
    }

    /// An issuer that plays back scripted replies, counting requests
    #[derive(Clone)]
    struct ScriptedIssuer {
        clock: TestClock,
        latency: Duration,
        calls: Arc<AtomicUsize>,
        replies: Arc<std::sync::Mutex<VecDeque<Reply>>>,
    }

    impl ScriptedIssuer {
        fn new(clock: &TestClock, replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                clock: clock.clone(),
                latency: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
                replies: Arc::new(std::sync::Mutex::new(replies.into_iter().collect())),
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenIssuer for ScriptedIssuer {
        async fn issue(&self, request: TokenRequest) -> Result<IssuedToken, TokenRequestError> {
            assert!(request.body.contains("apikey=test-key"));
            self.calls.fetch_add(1, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected token request");

            match reply {
                Reply::Token(token, lifetime) => Ok(IssuedToken {
                    access_token: AccessToken::from_static(token),
                    expiry: self.clock.now() + lifetime,
                    token_type: "Bearer".to_owned(),
                }),
                Reply::Stale(token) => Ok(IssuedToken {
                    access_token: AccessToken::from_static(token),
                    expiry: self.clock.now() - DurationSecs(5),
                    token_type: "Bearer".to_owned(),
                }),
                Reply::Reject(status, body) => Err(decode_error_response(status, body.as_bytes())),
            }
        }
    }

    fn ten_minutes(token: &'static str) -> Reply {
        Reply::Token(token, DurationSecs(600))
    }

    fn source(
        issuer: &ScriptedIssuer,
        clock: &TestClock,
    ) -> IamTokenSource<ScriptedIssuer, TestClock> {
        let credential = Credential::new(ApiKey::from_static("test-key")).unwrap();
        IamTokenSource::new_with_clock(issuer.clone(), credential, clock.clone())
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition was never met");
    }

    mod when_no_token_is_cached {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn source_starts_empty() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, []);
            let source = source(&issuer, &clock);

            assert_eq!(source.status(), TokenStatus::Empty);
            assert!(source.cached().is_none());
            assert_eq!(issuer.calls(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_callers_share_a_single_fetch() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1")])
                .with_latency(Duration::from_millis(250));
            let source = source(&issuer, &clock);

            let results = join_all((0..16).map(|_| source.token())).await;

            assert_eq!(issuer.calls(), 1);
            for result in results {
                assert_eq!(result.unwrap().as_str(), "tok1");
            }
            assert_eq!(source.status(), TokenStatus::Fresh);
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_callers_share_a_failed_fetch() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(
                &clock,
                [Reply::Reject(StatusCode::BAD_REQUEST, r#"{"errorMessage":"bad apikey"}"#)],
            )
            .with_latency(Duration::from_millis(250));
            let source = source(&issuer, &clock);

            let results = join_all((0..8).map(|_| source.token())).await;

            assert_eq!(issuer.calls(), 1);
            for result in results {
                let err = result.unwrap_err();
                assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
            }
        }

        #[tokio::test(start_paused = true)]
        async fn failed_fetch_is_reported_and_retried_on_next_call() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(
                &clock,
                [
                    Reply::Reject(StatusCode::BAD_REQUEST, r#"{"errorMessage":"bad apikey"}"#),
                    ten_minutes("tok1"),
                ],
            );
            let source = source(&issuer, &clock);

            match source.token().await.unwrap_err() {
                TokenRequestError::Rejected {
                    status, message, ..
                } => {
                    assert_eq!(status, StatusCode::BAD_REQUEST);
                    assert_eq!(message, "bad apikey");
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(source.status(), TokenStatus::Empty);

            assert_eq!(source.token().await.unwrap().as_str(), "tok1");
            assert_eq!(issuer.calls(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn token_expired_on_arrival_is_refused() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [Reply::Stale("stale"), ten_minutes("tok1")]);
            let source = source(&issuer, &clock);

            match source.token().await.unwrap_err() {
                TokenRequestError::AlreadyExpired { expiry } => {
                    assert_eq!(expiry, START - DurationSecs(5));
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(source.status(), TokenStatus::Empty);
            assert!(source.cached().is_none());

            assert_eq!(source.token().await.unwrap().as_str(), "tok1");
            assert_eq!(issuer.calls(), 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
        async fn callers_across_threads_share_a_single_fetch() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1")])
                .with_latency(Duration::from_millis(50));
            let source = source(&issuer, &clock);
            let barrier = Arc::new(tokio::sync::Barrier::new(64));

            let handles = (0..64).map(|_| {
                let source = source.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    source.token().await
                })
            });

            for result in join_all(handles).await {
                assert_eq!(result.unwrap().unwrap().as_str(), "tok1");
            }
            assert_eq!(issuer.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn refresh_is_scheduled_twenty_percent_before_expiry() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1")]);
            let source = source(&issuer, &clock);

            source.token().await.unwrap();

            let cached = source.cached().unwrap();
            assert_eq!(cached.expiry(), START + DurationSecs(600));
            assert_eq!(cached.refresh_at(), START + DurationSecs(480));
        }
    }

    mod when_a_fresh_token_is_cached {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn callers_are_served_without_suspending_or_fetching() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1")]);
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            for _ in 0..16 {
                let token = source
                    .token()
                    .now_or_never()
                    .expect("fresh token should be returned without suspending")
                    .unwrap();
                assert_eq!(token.as_str(), "tok1");
            }

            clock.advance(DurationSecs(479));
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");
            assert_eq!(issuer.calls(), 1);
        }
    }

    mod when_the_token_is_due_for_refresh {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn old_token_is_served_while_one_refresh_runs() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1"), ten_minutes("tok2")]);
            let source = source(&issuer, &clock);

            assert_eq!(source.token().await.unwrap().as_str(), "tok1");
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");
            assert_eq!(issuer.calls(), 1);

            clock.advance(DurationSecs(500));
            assert_eq!(source.status(), TokenStatus::RefreshDue);

            for _ in 0..16 {
                let token = source
                    .token()
                    .now_or_never()
                    .expect("valid token should be returned without suspending")
                    .unwrap();
                assert_eq!(token.as_str(), "tok1");
            }

            eventually(|| issuer.calls() == 2).await;
            assert_eq!(source.token().await.unwrap().as_str(), "tok2");
            assert_eq!(issuer.calls(), 2);

            let cached = source.cached().unwrap();
            assert_eq!(cached.expiry(), START + DurationSecs(1_100));
            assert_eq!(cached.refresh_at(), START + DurationSecs(980));
        }

        #[tokio::test(start_paused = true)]
        async fn pending_refresh_debounces_further_refreshes() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1"), ten_minutes("tok2")])
                .with_latency(Duration::from_secs(5));
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(500));
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");

            eventually(|| issuer.calls() == 2).await;
            let cached = source.cached().unwrap();
            assert_eq!(cached.access_token().as_str(), "tok1");
            assert_eq!(cached.refresh_at(), START + DurationSecs(560));
            assert_eq!(source.status(), TokenStatus::Fresh);

            for _ in 0..16 {
                let token = source
                    .token()
                    .now_or_never()
                    .expect("valid token should be returned without suspending")
                    .unwrap();
                assert_eq!(token.as_str(), "tok1");
            }

            eventually(|| {
                source
                    .cached()
                    .map_or(false, |cached| cached.access_token().as_str() == "tok2")
            })
            .await;
            assert_eq!(issuer.calls(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn refresh_expired_on_arrival_keeps_current_token() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(
                &clock,
                [ten_minutes("tok1"), Reply::Stale("stale"), ten_minutes("tok3")],
            );
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(500));
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");

            eventually(|| issuer.calls() == 2).await;
            let cached = source.cached().unwrap();
            assert_eq!(cached.access_token().as_str(), "tok1");
            assert_eq!(cached.refresh_at(), START + DurationSecs(480));
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");

            eventually(|| issuer.calls() == 3).await;
            assert_eq!(source.token().await.unwrap().as_str(), "tok3");
        }

        #[tokio::test(start_paused = true)]
        async fn failed_refresh_keeps_token_and_retries_on_next_call() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(
                &clock,
                [
                    ten_minutes("tok1"),
                    Reply::Reject(StatusCode::SERVICE_UNAVAILABLE, "try again later"),
                    ten_minutes("tok3"),
                ],
            );
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(500));
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");

            eventually(|| issuer.calls() == 2).await;
            assert_eq!(source.status(), TokenStatus::RefreshDue);
            assert_eq!(source.token().await.unwrap().as_str(), "tok1");

            eventually(|| issuer.calls() == 3).await;
            assert_eq!(source.token().await.unwrap().as_str(), "tok3");
        }
    }

    mod when_a_refresh_starts_too_late {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn refresh_finding_an_expired_token_does_nothing() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1"), ten_minutes("tok2")]);
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(500));
            let token = source
                .token()
                .now_or_never()
                .expect("valid token should be returned without suspending")
                .unwrap();
            assert_eq!(token.as_str(), "tok1");

            // The spawned refresh has not been polled yet
            clock.advance(DurationSecs(200));
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert_eq!(issuer.calls(), 1);
            let cached = source.cached().unwrap();
            assert_eq!(cached.refresh_at(), START + DurationSecs(480));
            assert_eq!(source.status(), TokenStatus::Expired);

            assert_eq!(source.token().await.unwrap().as_str(), "tok2");
            assert_eq!(issuer.calls(), 2);
        }
    }

    mod when_the_token_has_expired {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn expired_token_is_never_returned() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(&clock, [ten_minutes("tok1"), ten_minutes("tok2")]);
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(600));
            assert_eq!(source.status(), TokenStatus::Expired);

            assert_eq!(source.token().await.unwrap().as_str(), "tok2");
            assert_eq!(issuer.calls(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn failed_fetch_discards_the_expired_token() {
            let clock = TestClock::new(START);
            let issuer = ScriptedIssuer::new(
                &clock,
                [
                    ten_minutes("tok1"),
                    Reply::Reject(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
                ],
            );
            let source = source(&issuer, &clock);
            source.token().await.unwrap();

            clock.advance(DurationSecs(601));
            assert!(source.token().await.is_err());
            assert_eq!(source.status(), TokenStatus::Empty);
        }
    }
}
