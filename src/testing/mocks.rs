//! Mock protocol engine for testing
//!
//! Implements every capability trait in [`crate::engine`] with scripted
//! failures, recorded calls, and controllable closed signals, so the
//! lifecycle and classification logic can be exercised without a broker.
//! Call counters are plain atomics readable without awaiting; recorded
//! payloads sit behind async mutexes with getter methods.

use crate::engine::{
    ConnectionHandle, ControlChannel, DeliveryTag, LinkHandle, LinkSettings, ProtocolEngine,
    SafeClose, SessionHandle,
};
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::identity::{DeviceIdentity, SecurityToken, TokenProvider, TokenProviderError};
use crate::outcome::{Disposition, Outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Token provider minting tokens with a fixed lifetime from now.
///
/// Each issued token carries a distinct value, so tests can tell renewals
/// apart from the initial exchange.
pub struct FixedLifetimeProvider {
    lifetime: Duration,
    issued: AtomicUsize,
}

impl FixedLifetimeProvider {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn issue_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FixedLifetimeProvider {
    async fn issue_token(&self, _audience: &str) -> Result<SecurityToken, TokenProviderError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.lifetime).unwrap_or(chrono::Duration::zero());
        Ok(SecurityToken::new(format!("mock-token-{n}"), expires_at))
    }
}

/// Token provider whose signing backend is down.
pub struct FailingTokenProvider {
    message: String,
}

impl FailingTokenProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for FailingTokenProvider {
    async fn issue_token(&self, _audience: &str) -> Result<SecurityToken, TokenProviderError> {
        Err(self.message.clone().into())
    }
}

/// Shared closing state + closed signal used by every mock handle.
#[derive(Debug)]
struct MockTeardown {
    closing: AtomicBool,
    safe_close_calls: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

impl MockTeardown {
    fn new() -> Self {
        let (closed_tx, _rx) = watch::channel(false);
        Self {
            closing: AtomicBool::new(false),
            safe_close_calls: AtomicUsize::new(0),
            closed_tx,
        }
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Mock claims-based-security channel.
pub struct MockControlChannel {
    teardown: MockTeardown,
    put_token_calls: AtomicUsize,
    pub put_tokens: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    scripted_failures: Mutex<VecDeque<EngineError>>,
}

impl MockControlChannel {
    pub fn new() -> Self {
        Self {
            teardown: MockTeardown::new(),
            put_token_calls: AtomicUsize::new(0),
            put_tokens: Arc::new(Mutex::new(Vec::new())),
            scripted_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Script the next put-token call to fail with `error`.
    pub async fn fail_next_put_token(&self, error: EngineError) {
        self.scripted_failures.lock().await.push_back(error);
    }

    pub fn put_token_call_count(&self) -> usize {
        self.put_token_calls.load(Ordering::SeqCst)
    }

    pub fn safe_close_call_count(&self) -> usize {
        self.teardown.safe_close_calls.load(Ordering::SeqCst)
    }

    /// Recorded (audience, expiry) pairs in call order.
    pub async fn get_put_tokens(&self) -> Vec<(String, DateTime<Utc>)> {
        self.put_tokens.lock().await.clone()
    }
}

#[async_trait]
impl SafeClose for MockControlChannel {
    async fn safe_close(&self) {
        self.teardown.safe_close_calls.fetch_add(1, Ordering::SeqCst);
        self.teardown.close();
    }

    fn is_closing(&self) -> bool {
        self.teardown.is_closing()
    }
}

#[async_trait]
impl ControlChannel for MockControlChannel {
    async fn put_token(
        &self,
        audience: &str,
        token: &SecurityToken,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        self.put_token_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.scripted_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.put_tokens
            .lock()
            .await
            .push((audience.to_string(), token.expires_at()));
        Ok(())
    }
}

/// Mock link recording sends and settlements, with scripted outcomes.
pub struct MockLinkHandle {
    teardown: MockTeardown,
    pub settings: LinkSettings,
    send_calls: AtomicUsize,
    pub sent: Arc<Mutex<Vec<(Envelope, DeliveryTag)>>>,
    scripted_outcomes: Mutex<VecDeque<Result<Outcome, EngineError>>>,
    pub dispositions: Arc<Mutex<Vec<(DeliveryTag, Disposition)>>>,
    inbound: Mutex<VecDeque<(Envelope, DeliveryTag)>>,
}

impl MockLinkHandle {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            teardown: MockTeardown::new(),
            settings,
            send_calls: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            scripted_outcomes: Mutex::new(VecDeque::new()),
            dispositions: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(VecDeque::new()),
        }
    }

    /// Script the outcome (or failure) of the next send. Unscripted sends
    /// settle accepted.
    pub async fn script_send(&self, result: Result<Outcome, EngineError>) {
        self.scripted_outcomes.lock().await.push_back(result);
    }

    /// Queue an inbound delivery for the next receive call.
    pub async fn queue_inbound(&self, envelope: Envelope, tag: DeliveryTag) {
        self.inbound.lock().await.push_back((envelope, tag));
    }

    pub fn send_call_count(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn safe_close_call_count(&self) -> usize {
        self.teardown.safe_close_calls.load(Ordering::SeqCst)
    }

    pub async fn get_sent(&self) -> Vec<(Envelope, DeliveryTag)> {
        self.sent.lock().await.clone()
    }

    pub async fn get_dispositions(&self) -> Vec<(DeliveryTag, Disposition)> {
        self.dispositions.lock().await.clone()
    }

    /// Simulate the peer detaching the link.
    pub fn simulate_remote_close(&self) {
        self.teardown.close();
    }
}

#[async_trait]
impl SafeClose for MockLinkHandle {
    async fn safe_close(&self) {
        self.teardown.safe_close_calls.fetch_add(1, Ordering::SeqCst);
        self.teardown.close();
    }

    fn is_closing(&self) -> bool {
        self.teardown.is_closing()
    }
}

#[async_trait]
impl LinkHandle for MockLinkHandle {
    async fn send(
        &self,
        envelope: Envelope,
        tag: DeliveryTag,
        _timeout: Duration,
    ) -> Result<Outcome, EngineError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripted_outcomes.lock().await.pop_front();
        match scripted {
            Some(Err(error)) => Err(error),
            Some(Ok(outcome)) => {
                self.sent.lock().await.push((envelope, tag));
                Ok(outcome)
            }
            None => {
                self.sent.lock().await.push((envelope, tag));
                Ok(Outcome::accepted())
            }
        }
    }

    async fn receive(&self, timeout: Duration) -> Result<(Envelope, DeliveryTag), EngineError> {
        match self.inbound.lock().await.pop_front() {
            Some(delivery) => Ok(delivery),
            None => Err(EngineError::timeout(timeout)),
        }
    }

    async fn disposition(
        &self,
        tag: &DeliveryTag,
        disposition: Disposition,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        self.dispositions
            .lock()
            .await
            .push((tag.clone(), disposition));
        Ok(())
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.teardown.closed_tx.subscribe()
    }
}

/// Mock session producing [`MockLinkHandle`]s.
pub struct MockSessionHandle {
    teardown: MockTeardown,
    open_link_calls: AtomicUsize,
    scripted_failures: Mutex<VecDeque<EngineError>>,
    pub links: Arc<Mutex<Vec<Arc<MockLinkHandle>>>>,
}

impl MockSessionHandle {
    pub fn new() -> Self {
        Self {
            teardown: MockTeardown::new(),
            open_link_calls: AtomicUsize::new(0),
            scripted_failures: Mutex::new(VecDeque::new()),
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn fail_next_open_link(&self, error: EngineError) {
        self.scripted_failures.lock().await.push_back(error);
    }

    pub fn open_link_call_count(&self) -> usize {
        self.open_link_calls.load(Ordering::SeqCst)
    }

    pub fn safe_close_call_count(&self) -> usize {
        self.teardown.safe_close_calls.load(Ordering::SeqCst)
    }

    /// Link handles opened through this session, in order.
    pub async fn get_links(&self) -> Vec<Arc<MockLinkHandle>> {
        self.links.lock().await.clone()
    }
}

impl Default for MockSessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SafeClose for MockSessionHandle {
    async fn safe_close(&self) {
        self.teardown.safe_close_calls.fetch_add(1, Ordering::SeqCst);
        self.teardown.close();
        // Engine semantics: session teardown detaches its links
        for link in self.links.lock().await.iter() {
            link.teardown.close();
        }
    }

    fn is_closing(&self) -> bool {
        self.teardown.is_closing()
    }
}

#[async_trait]
impl SessionHandle for MockSessionHandle {
    async fn open_link(
        &self,
        settings: &LinkSettings,
        _timeout: Duration,
    ) -> Result<Arc<dyn LinkHandle>, EngineError> {
        self.open_link_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.scripted_failures.lock().await.pop_front() {
            return Err(error);
        }
        let link = Arc::new(MockLinkHandle::new(settings.clone()));
        self.links.lock().await.push(Arc::clone(&link));
        Ok(link)
    }
}

/// Mock connection producing sessions and a control channel.
pub struct MockConnectionHandle {
    teardown: MockTeardown,
    open_session_calls: AtomicUsize,
    open_control_calls: AtomicUsize,
    session_failures: Mutex<VecDeque<EngineError>>,
    control_failures: Mutex<VecDeque<EngineError>>,
    pub sessions: Arc<Mutex<Vec<Arc<MockSessionHandle>>>>,
    pub control: Arc<MockControlChannel>,
}

impl MockConnectionHandle {
    pub fn new() -> Self {
        Self {
            teardown: MockTeardown::new(),
            open_session_calls: AtomicUsize::new(0),
            open_control_calls: AtomicUsize::new(0),
            session_failures: Mutex::new(VecDeque::new()),
            control_failures: Mutex::new(VecDeque::new()),
            sessions: Arc::new(Mutex::new(Vec::new())),
            control: Arc::new(MockControlChannel::new()),
        }
    }

    pub async fn fail_next_open_session(&self, error: EngineError) {
        self.session_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_open_control(&self, error: EngineError) {
        self.control_failures.lock().await.push_back(error);
    }

    pub fn open_session_call_count(&self) -> usize {
        self.open_session_calls.load(Ordering::SeqCst)
    }

    pub fn open_control_call_count(&self) -> usize {
        self.open_control_calls.load(Ordering::SeqCst)
    }

    pub fn safe_close_call_count(&self) -> usize {
        self.teardown.safe_close_calls.load(Ordering::SeqCst)
    }

    pub async fn get_sessions(&self) -> Vec<Arc<MockSessionHandle>> {
        self.sessions.lock().await.clone()
    }

    /// Simulate the peer (or the socket) killing the connection.
    pub fn simulate_remote_close(&self) {
        self.teardown.close();
    }
}

impl Default for MockConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SafeClose for MockConnectionHandle {
    async fn safe_close(&self) {
        self.teardown.safe_close_calls.fetch_add(1, Ordering::SeqCst);
        self.teardown.close();
        // Engine semantics: connection teardown cascades downward
        for session in self.sessions.lock().await.iter() {
            session.safe_close().await;
        }
        self.control.teardown.close();
    }

    fn is_closing(&self) -> bool {
        self.teardown.is_closing()
    }
}

#[async_trait]
impl ConnectionHandle for MockConnectionHandle {
    async fn open_session(
        &self,
        _timeout: Duration,
    ) -> Result<Arc<dyn SessionHandle>, EngineError> {
        self.open_session_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.session_failures.lock().await.pop_front() {
            return Err(error);
        }
        let session = Arc::new(MockSessionHandle::new());
        self.sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }

    async fn open_control_channel(
        &self,
        _timeout: Duration,
    ) -> Result<Arc<dyn ControlChannel>, EngineError> {
        self.open_control_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.control_failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(Arc::clone(&self.control) as Arc<dyn ControlChannel>)
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.teardown.closed_tx.subscribe()
    }
}

/// Mock engine handing out one pre-built connection handle per dial.
pub struct MockEngine {
    connect_failures: Mutex<VecDeque<EngineError>>,
    pub connections: Arc<Mutex<Vec<Arc<MockConnectionHandle>>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            connect_failures: Mutex::new(VecDeque::new()),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn fail_next_connect(&self, error: EngineError) {
        self.connect_failures.lock().await.push_back(error);
    }

    pub async fn get_connections(&self) -> Vec<Arc<MockConnectionHandle>> {
        self.connections.lock().await.clone()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn open_connection(
        &self,
        _identity: &DeviceIdentity,
        _timeout: Duration,
    ) -> Result<Arc<dyn ConnectionHandle>, EngineError> {
        if let Some(error) = self.connect_failures.lock().await.pop_front() {
            return Err(error);
        }
        let connection = Arc::new(MockConnectionHandle::new());
        self.connections.lock().await.push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_link_records_sends_and_defaults_to_accepted() {
        let link = MockLinkHandle::new(LinkSettings::sender("s", "/addr"));

        let outcome = link
            .send(
                Envelope::new(),
                DeliveryTag::random(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(outcome.is_accepted());
        assert_eq!(link.send_call_count(), 1);
        assert_eq!(link.get_sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_link_scripted_failure_is_not_recorded_as_sent() {
        let link = MockLinkHandle::new(LinkSettings::sender("s", "/addr"));
        link.script_send(Err(EngineError::aborted("boom"))).await;

        let result = link
            .send(
                Envelope::new(),
                DeliveryTag::random(),
                Duration::from_secs(1),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(link.send_call_count(), 1);
        assert!(link.get_sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_close_cascades_to_children() {
        let connection = MockConnectionHandle::new();
        let session = connection.open_session(Duration::from_secs(1)).await.unwrap();
        let _control = connection
            .open_control_channel(Duration::from_secs(1))
            .await
            .unwrap();

        connection.safe_close().await;

        assert!(connection.is_closing());
        assert!(session.is_closing());
        assert!(connection.control.is_closing());
    }

    #[tokio::test]
    async fn test_fixed_lifetime_provider_mints_distinct_tokens() {
        let provider = FixedLifetimeProvider::new(Duration::from_secs(60));

        let first = provider.issue_token("aud").await.unwrap();
        let second = provider.issue_token("aud").await.unwrap();

        assert_ne!(first.value(), second.value());
        assert_eq!(provider.issue_count(), 2);
    }
}
