//! Connection and Session Lifecycle Tests
//!
//! Exercises the ownership chain against the mock engine:
//! - Fail-fast on closing connections and sessions
//! - Idempotent and concurrent safe-close
//! - Exactly-once closed notifications
//! - Lazy single control channel and fail-closed refresher creation

use hublink::error::EngineError;
use hublink::testing::mocks::{
    FailingTokenProvider, FixedLifetimeProvider, MockConnectionHandle, MockEngine,
};
use hublink::{
    Connection, DeviceIdentity, LinkSettings, RefresherState, TransportConfig, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_identity() -> DeviceIdentity {
    DeviceIdentity::for_device(
        "contoso.example.net",
        "device-1",
        Arc::new(FixedLifetimeProvider::new(Duration::from_secs(3600))),
    )
}

async fn open_connection(engine: &MockEngine) -> (Connection, Arc<MockConnectionHandle>) {
    let config = TransportConfig::default();
    let connection = Connection::open(engine, &test_identity(), &config, TIMEOUT)
        .await
        .expect("mock connect should succeed");
    let handle = engine.get_connections().await[0].clone();
    (connection, handle)
}

#[tokio::test]
async fn test_open_session_on_closing_connection_makes_zero_engine_calls() {
    // Arrange
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    connection.safe_close().await;

    // Act
    let error = connection.open_session(TIMEOUT).await.unwrap_err();

    // Assert: communication failure, and the engine was never asked
    assert!(matches!(error, TransportError::Communication { .. }));
    assert!(error.is_retryable());
    assert_eq!(handle.open_session_call_count(), 0);
}

#[tokio::test]
async fn test_create_refresher_on_closing_connection_fails_fast() {
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    connection.safe_close().await;

    let error = connection
        .create_refresher(&test_identity(), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(error, TransportError::Communication { .. }));
    assert_eq!(handle.open_control_call_count(), 0);
}

#[tokio::test]
async fn test_safe_close_many_times_reaches_same_terminal_state() {
    let engine = MockEngine::new();
    let (connection, _handle) = open_connection(&engine).await;

    for _ in 0..5 {
        connection.safe_close().await;
    }

    assert!(connection.is_closing());
}

#[tokio::test]
async fn test_concurrent_safe_close_publishes_one_notification() {
    // Arrange
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    let connection = Arc::new(connection);
    let subscription = connection.subscribe_closed();

    // Act: three teardown paths race, one of them remote
    let (a, b) = futures::join!(
        async { connection.safe_close().await },
        async { connection.safe_close().await },
    );
    handle.simulate_remote_close();
    let _ = (a, b);

    // Assert: the notification resolves and the state is terminal
    tokio::time::timeout(Duration::from_secs(1), subscription.closed())
        .await
        .expect("closed notification should resolve exactly once");
    assert!(connection.is_closing());
}

#[tokio::test]
async fn test_remote_close_notifies_without_local_close() {
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    let subscription = connection.subscribe_closed();

    handle.simulate_remote_close();

    tokio::time::timeout(Duration::from_secs(1), subscription.closed())
        .await
        .expect("peer-initiated close should fire the notification");
    assert!(connection.is_closing());

    // And a fail-fast check now rejects new work
    let error = connection.open_session(TIMEOUT).await.unwrap_err();
    assert!(matches!(error, TransportError::Communication { .. }));
}

#[tokio::test]
async fn test_session_open_failure_is_classified() {
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    handle
        .fail_next_open_session(EngineError::timeout(Duration::from_secs(5)))
        .await;

    let error = connection.open_session(TIMEOUT).await.unwrap_err();

    assert!(matches!(error, TransportError::Communication { .. }));
    // A timeout does not force the connection down
    assert!(!connection.is_closing());
}

#[tokio::test]
async fn test_session_open_exhaustion_closes_connection() {
    // Arrange
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    handle
        .fail_next_open_session(EngineError::resource_limit_exceeded("session quota"))
        .await;
    let subscription = connection.subscribe_closed();

    // Act
    let error = connection.open_session(TIMEOUT).await.unwrap_err();

    // Assert: connection observably closed before the error surfaced
    assert!(matches!(error, TransportError::Communication { .. }));
    assert!(connection.is_closing());
    assert!(handle.safe_close_call_count() >= 1);
    tokio::time::timeout(Duration::from_secs(1), subscription.closed())
        .await
        .expect("forced close should fire the notification");
}

#[tokio::test]
async fn test_refresher_creation_authenticates_before_returning() {
    // Arrange
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;

    // Act
    let refresher = connection
        .create_refresher(&test_identity(), TIMEOUT)
        .await
        .unwrap();

    // Assert: "refresher created" means "currently authenticated"
    assert!(matches!(
        refresher.state(),
        RefresherState::Authenticated { .. }
    ));
    assert_eq!(handle.control.put_token_call_count(), 1);

    let tokens = handle.control.get_put_tokens().await;
    assert_eq!(tokens[0].0, "contoso.example.net");
}

#[tokio::test]
async fn test_control_channel_is_shared_across_refreshers() {
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;

    let first = connection
        .create_refresher(&test_identity(), TIMEOUT)
        .await
        .unwrap();
    let second = connection
        .create_refresher(&test_identity(), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(handle.open_control_call_count(), 1);
    assert_eq!(handle.control.put_token_call_count(), 2);
    drop(first);
    drop(second);
}

#[tokio::test]
async fn test_refresher_creation_fails_closed_on_bad_credential() {
    // Arrange
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    let identity = DeviceIdentity::for_device(
        "contoso.example.net",
        "device-1",
        Arc::new(FailingTokenProvider::new("signing backend down")),
    );

    // Act
    let error = connection.create_refresher(&identity, TIMEOUT).await.unwrap_err();

    // Assert: the failure surfaced and no renewal loop is running
    assert!(matches!(error, TransportError::Unauthorized { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.control.put_token_call_count(), 0);
}

#[tokio::test]
async fn test_control_channel_open_failure_is_classified() {
    let engine = MockEngine::new();
    let (connection, handle) = open_connection(&engine).await;
    handle
        .fail_next_open_control(EngineError::unauthorized_access("cbs attach refused"))
        .await;

    let error = connection
        .create_refresher(&test_identity(), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(error, TransportError::Unauthorized { .. }));
}

#[tokio::test]
async fn test_sessions_do_not_outlive_their_connection() {
    let engine = MockEngine::new();
    let (connection, _handle) = open_connection(&engine).await;
    let session = connection.open_session(TIMEOUT).await.unwrap();

    connection.safe_close().await;

    // Engine teardown cascaded; the session now fails fast
    assert!(session.is_closing());
    let error = session
        .open_sending_link(LinkSettings::sender("telemetry", "/addr"), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(error, TransportError::Communication { .. }));
}
