//! Continuous token renewal bound to a control channel
//!
//! A refresher keeps one identity authenticated by re-presenting a fresh
//! token on the connection's control channel before the previous token
//! expires. The first exchange runs synchronously inside
//! [`crate::connection::Connection::create_refresher`], so a refresher
//! that exists has authenticated at least once; renewal then continues in
//! a background task until it is cancelled, fails terminally, or the
//! refresher is dropped.

use crate::classify::recover;
use crate::config::TokenPolicy;
use crate::engine::ControlChannel;
use crate::error::{Result, TransportError};
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observable lifecycle of a refresher.
#[derive(Debug, Clone, PartialEq)]
pub enum RefresherState {
    /// Constructed, first exchange not yet run.
    Created,
    /// A token exchange is in flight.
    Authenticating,
    /// The broker accepted a token valid until `expires_at`.
    Authenticated { expires_at: DateTime<Utc> },
    /// Cancelled cooperatively; no further exchanges will run.
    Cancelled,
    /// Renewal stopped for good; the identity is no longer being kept
    /// authenticated and the owner must tear down or rebuild.
    Failed { message: String },
}

struct RefresherInner {
    identity: DeviceIdentity,
    control: Arc<dyn ControlChannel>,
    policy: TokenPolicy,
    state_tx: watch::Sender<RefresherState>,
    cancel_tx: watch::Sender<bool>,
}

impl RefresherInner {
    fn set_state(&self, state: RefresherState) {
        let _ = self.state_tx.send(state);
    }
}

/// Keeps one identity authenticated for as long as it lives.
///
/// Created through [`crate::connection::Connection::create_refresher`];
/// there is no other way to obtain one, which guarantees the first
/// exchange has run before any caller holds the value.
pub struct AuthenticationRefresher {
    inner: Arc<RefresherInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AuthenticationRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationRefresher")
            .finish_non_exhaustive()
    }
}

impl AuthenticationRefresher {
    pub(crate) fn new(
        identity: DeviceIdentity,
        control: Arc<dyn ControlChannel>,
        policy: TokenPolicy,
    ) -> Self {
        let (state_tx, _state_rx) = watch::channel(RefresherState::Created);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        Self {
            inner: Arc::new(RefresherInner {
                identity,
                control,
                policy,
                state_tx,
                cancel_tx,
            }),
            loop_handle: Mutex::new(None),
        }
    }

    /// Run the first token exchange, then start the renewal loop.
    ///
    /// The first exchange happens on the caller's stack: when this returns
    /// `Ok` the identity is authenticated and the background task owns
    /// renewal from here on, reusing `timeout` for every exchange. On
    /// failure the loop is never started, the refresher lands in
    /// [`RefresherState::Failed`], and the classified error is returned.
    pub(crate) async fn init_loop(&self, timeout: Duration) -> Result<()> {
        if !matches!(self.state(), RefresherState::Created) {
            return Err(TransportError::communication(
                "authentication refresher already started",
            ));
        }
        self.inner.set_state(RefresherState::Authenticating);

        match refresh_once(&self.inner, timeout).await {
            Ok(expires_at) => {
                self.inner
                    .set_state(RefresherState::Authenticated { expires_at });
                info!(
                    device_id = %self.inner.identity.device_id(),
                    %expires_at,
                    "authenticated, starting token renewal loop"
                );

                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(run_renewal_loop(inner, timeout, expires_at));
                if let Ok(mut slot) = self.loop_handle.lock() {
                    *slot = Some(handle);
                }
                Ok(())
            }
            Err(error) => {
                warn!(
                    device_id = %self.inner.identity.device_id(),
                    error = %error,
                    "initial token exchange failed"
                );
                self.inner.set_state(RefresherState::Failed {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> RefresherState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RefresherState> {
        self.inner.state_tx.subscribe()
    }

    /// Request cooperative cancellation.
    ///
    /// Safe to call at any time, including while an exchange is in
    /// flight; the loop observes the request at its next wait point and
    /// unwinds into [`RefresherState::Cancelled`] without error.
    pub fn cancel(&self) {
        let _ = self.inner.cancel_tx.send(true);
    }
}

impl Drop for AuthenticationRefresher {
    fn drop(&mut self) {
        let _ = self.inner.cancel_tx.send(true);
        if let Ok(mut slot) = self.loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// One full exchange: mint a token for the identity's audience and present
/// it on the control channel. Provider failures are authorization
/// failures; engine failures go through the classifier with the control
/// channel as the recovery target.
async fn refresh_once(inner: &RefresherInner, timeout: Duration) -> Result<DateTime<Utc>> {
    let audience = inner.identity.audience();
    let token = inner
        .identity
        .token_provider()
        .issue_token(audience)
        .await
        .map_err(|e| TransportError::unauthorized(format!("token issue failed: {e}")))?;

    if token.is_expired_at(Utc::now()) {
        return Err(TransportError::unauthorized(
            "issued token is already expired",
        ));
    }

    let expires_at = token.expires_at();
    match inner.control.put_token(audience, &token, timeout).await {
        Ok(()) => {
            debug!(audience, %expires_at, "token accepted");
            Ok(expires_at)
        }
        Err(raw) => Err(recover(raw, inner.control.as_ref()).await),
    }
}

async fn run_renewal_loop(
    inner: Arc<RefresherInner>,
    timeout: Duration,
    mut expires_at: DateTime<Utc>,
) {
    let mut cancel_rx = inner.cancel_tx.subscribe();

    'renew: loop {
        let delay = inner.policy.renewal_delay(remaining_lifetime(expires_at));
        debug!(delay_secs = delay.as_secs(), "scheduling next token renewal");

        if !sleep_unless_cancelled(delay, &mut cancel_rx).await {
            inner.set_state(RefresherState::Cancelled);
            return;
        }
        if inner.control.is_closing() {
            info!("control channel is closing, stopping token renewal");
            inner.set_state(RefresherState::Cancelled);
            return;
        }

        inner.set_state(RefresherState::Authenticating);
        match refresh_once(&inner, timeout).await {
            Ok(next_expiry) => {
                expires_at = next_expiry;
                inner
                    .set_state(RefresherState::Authenticated { expires_at });
            }
            Err(TransportError::Unauthorized { message }) => {
                // A rejected credential will not pass on retry
                warn!(error = %message, "token rejected, stopping renewal");
                inner.set_state(RefresherState::Failed { message });
                return;
            }
            Err(first_error) => {
                let retry = inner.policy.retry_interval();
                let mut last_error = first_error;

                loop {
                    warn!(
                        error = %last_error,
                        retry_secs = retry.as_secs(),
                        "token renewal failed, retrying"
                    );
                    if remaining_lifetime(expires_at) <= retry {
                        inner.set_state(RefresherState::Failed {
                            message: format!("token renewal gave up: {last_error}"),
                        });
                        return;
                    }
                    if !sleep_unless_cancelled(retry, &mut cancel_rx).await {
                        inner.set_state(RefresherState::Cancelled);
                        return;
                    }
                    if inner.control.is_closing() {
                        inner.set_state(RefresherState::Cancelled);
                        return;
                    }

                    match refresh_once(&inner, timeout).await {
                        Ok(next_expiry) => {
                            expires_at = next_expiry;
                            inner
                                .set_state(RefresherState::Authenticated { expires_at });
                            continue 'renew;
                        }
                        Err(TransportError::Unauthorized { message }) => {
                            warn!(error = %message, "token rejected, stopping renewal");
                            inner.set_state(RefresherState::Failed { message });
                            return;
                        }
                        Err(error) => {
                            last_error = error;
                        }
                    }
                }
            }
        }
    }
}

fn remaining_lifetime(expires_at: DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Interruptible sleep. Returns true if the delay elapsed, false if
/// cancellation was requested first.
async fn sleep_unless_cancelled(delay: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    if *cancel_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel_rx.wait_for(|cancelled| *cancelled) => false,
    }
}
