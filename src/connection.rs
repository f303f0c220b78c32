//! Connection lifecycle
//!
//! A [`Connection`] owns one engine connection handle and is the root of
//! the ownership chain: it creates sessions, lazily opens the single
//! control channel, and mints authentication refreshers. Every operation
//! first consults the closing flag, then drives the engine, then routes
//! any failure through the classifier. The engine's closed signal is
//! republished through an exactly-once closed event so the device layer
//! learns the connection is dead exactly once, whichever teardown path
//! fired first.

use crate::classify::{recover, surface};
use crate::config::{TokenPolicy, TransportConfig};
use crate::engine::{ConnectionHandle, ControlChannel, ProtocolEngine};
use crate::error::{Result, TransportError};
use crate::events::{ClosedEvent, ClosedSubscription};
use crate::identity::DeviceIdentity;
use crate::refresher::AuthenticationRefresher;
use crate::session::Session;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One logical transport connection to the broker.
pub struct Connection {
    handle: Arc<dyn ConnectionHandle>,
    token_policy: TokenPolicy,
    // At most one control channel per connection, opened on first use.
    control: OnceCell<Arc<dyn ControlChannel>>,
    closed: Arc<ClosedEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial the broker for `identity` and wrap the resulting handle.
    ///
    /// Open failures are classified before they surface; there is nothing
    /// to recover at this point, so exhaustion degenerates to a plain
    /// communication failure.
    pub async fn open(
        engine: &dyn ProtocolEngine,
        identity: &DeviceIdentity,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Self> {
        debug!(
            host = identity.host_name(),
            device_id = identity.device_id(),
            "opening connection"
        );
        let handle = engine
            .open_connection(identity, timeout)
            .await
            .map_err(surface)?;

        info!(
            host = identity.host_name(),
            device_id = identity.device_id(),
            "connection open"
        );
        Ok(Self::from_handle(handle, config.token.clone()))
    }

    pub(crate) fn from_handle(handle: Arc<dyn ConnectionHandle>, token_policy: TokenPolicy) -> Self {
        let closed = Arc::new(ClosedEvent::new());

        // Forward the engine's closed signal into the exactly-once event.
        let mut engine_closed = handle.subscribe_closed();
        let event = Arc::clone(&closed);
        let monitor = tokio::spawn(async move {
            if engine_closed.wait_for(|closed| *closed).await.is_ok() {
                if event.fire() {
                    warn!("connection closed by the transport");
                }
            }
        });

        Self {
            handle,
            token_policy,
            control: OnceCell::new(),
            closed,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// Open a new session over this connection.
    ///
    /// Fails fast with a communication error when the connection is
    /// closing; no engine call is made in that case.
    pub async fn open_session(&self, timeout: Duration) -> Result<Session> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot open a session on a closing connection",
            ));
        }
        match self.handle.open_session(timeout).await {
            Ok(session) => {
                debug!("session open");
                Ok(Session::new(session))
            }
            Err(raw) => Err(recover(raw, self.handle.as_ref()).await),
        }
    }

    /// Create a refresher for `identity` and authenticate it.
    ///
    /// The control channel is opened on first use and shared by every
    /// refresher afterwards. The first token exchange runs on this call's
    /// stack; when it returns `Ok` the identity is authenticated and the
    /// renewal loop is already running. A failed first exchange surfaces
    /// the classified error and the loop never starts.
    pub async fn create_refresher(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<AuthenticationRefresher> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot create a refresher on a closing connection",
            ));
        }

        let control = self
            .control
            .get_or_try_init(|| async {
                debug!("opening control channel");
                match self.handle.open_control_channel(timeout).await {
                    Ok(channel) => Ok(channel),
                    Err(raw) => Err(recover(raw, self.handle.as_ref()).await),
                }
            })
            .await?;

        let refresher = AuthenticationRefresher::new(
            identity.clone(),
            Arc::clone(control),
            self.token_policy.clone(),
        );
        refresher.init_loop(timeout).await?;
        Ok(refresher)
    }

    /// Best-effort teardown. Idempotent, never fails, safe to call from
    /// multiple tasks at once.
    pub async fn safe_close(&self) {
        self.handle.safe_close().await;
        if self.closed.fire() {
            info!("connection closed");
        }
    }

    /// Whether teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.closed.has_fired() || self.handle.is_closing()
    }

    /// Subscribe to the closed notification. It resolves exactly once no
    /// matter how many teardown paths race.
    pub fn subscribe_closed(&self) -> ClosedSubscription {
        self.closed.subscribe()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::identity::{SecurityToken, StaticTokenProvider};
    use crate::testing::mocks::{MockConnectionHandle, MockEngine};
    use chrono::Utc;

    fn test_identity() -> DeviceIdentity {
        let token = SecurityToken::new(
            "SharedAccessSignature sig=test",
            Utc::now() + chrono::Duration::hours(1),
        );
        DeviceIdentity::for_device(
            "contoso.example.net",
            "device-1",
            Arc::new(StaticTokenProvider::new(token)),
        )
    }

    #[tokio::test]
    async fn test_open_yields_usable_connection() {
        let engine = MockEngine::new();

        let connection = Connection::open(
            &engine,
            &test_identity(),
            &TransportConfig::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(!connection.is_closing());
        assert_eq!(engine.get_connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_classified() {
        let engine = MockEngine::new();
        engine
            .fail_next_connect(EngineError::unauthorized_access("bad credentials"))
            .await;

        let error = Connection::open(
            &engine,
            &test_identity(),
            &TransportConfig::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, TransportError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_safe_close_is_idempotent() {
        let handle = Arc::new(MockConnectionHandle::new());
        let connection = Connection::from_handle(handle.clone(), TokenPolicy::default());

        connection.safe_close().await;
        connection.safe_close().await;
        connection.safe_close().await;

        assert!(connection.is_closing());
        assert_eq!(handle.safe_close_call_count(), 3);
        assert!(connection.closed.has_fired());
    }

    #[tokio::test]
    async fn test_control_channel_opened_at_most_once() {
        let handle = Arc::new(MockConnectionHandle::new());
        let connection = Connection::from_handle(handle.clone(), TokenPolicy::default());
        let identity = test_identity();

        let first = connection
            .create_refresher(&identity, Duration::from_secs(5))
            .await
            .unwrap();
        let second = connection
            .create_refresher(&identity, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(handle.open_control_call_count(), 1);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_remote_close_fires_closed_event() {
        let handle = Arc::new(MockConnectionHandle::new());
        let connection = Connection::from_handle(handle.clone(), TokenPolicy::default());
        let subscription = connection.subscribe_closed();

        handle.simulate_remote_close();

        tokio::time::timeout(Duration::from_secs(1), subscription.closed())
            .await
            .expect("closed event should fire on remote close");
        assert!(connection.is_closing());
    }
}
