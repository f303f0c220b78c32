//! Protocol-engine capability traits
//!
//! The wire protocol (framing, flow control, settlement bookkeeping) lives
//! outside this crate. This module defines the seam it is consumed through:
//! a handful of object-safe async traits an engine implements and this
//! crate drives. The crate never names a concrete engine type; everything
//! is `Arc<dyn ...>` behind these traits, which is also what makes the
//! lifecycle logic testable against [`crate::testing::mocks`].

use crate::envelope::{Envelope, PropertyValue};
use crate::error::EngineError;
use crate::identity::{DeviceIdentity, SecurityToken};
use crate::outcome::{Disposition, Outcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Parameters for attaching one link to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub role: LinkRole,
    /// Link name, unique within the session.
    pub name: String,
    /// Node address the link attaches to.
    pub address: String,
    /// Attach-time properties forwarded to the peer.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Receiver credit hint. Ignored for senders.
    pub prefetch_count: Option<u32>,
}

impl LinkSettings {
    pub fn sender(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            role: LinkRole::Sender,
            name: name.into(),
            address: address.into(),
            properties: BTreeMap::new(),
            prefetch_count: None,
        }
    }

    pub fn receiver(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            role: LinkRole::Receiver,
            name: name.into(),
            address: address.into(),
            properties: BTreeMap::new(),
            prefetch_count: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_prefetch(mut self, count: u32) -> Self {
        self.prefetch_count = Some(count);
        self
    }
}

/// Tag identifying one physical delivery attempt.
///
/// Every attempt gets a fresh random tag, so a retried delivery is never
/// mistaken for a duplicate of the first attempt. Broker-assigned tags on
/// received deliveries can be arbitrary bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(Vec<u8>);

impl DeliveryTag {
    /// Fresh random tag for an outgoing delivery.
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for DeliveryTag {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Best-effort teardown shared by every engine object.
///
/// `safe_close` must be idempotent and must not fail: it is called from
/// recovery paths that have nothing sensible to do with a secondary
/// failure. `is_closing` must answer without blocking.
#[async_trait]
pub trait SafeClose: Send + Sync {
    async fn safe_close(&self);

    fn is_closing(&self) -> bool;
}

/// Entry point: dial one authenticated connection for an identity.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn open_connection(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Arc<dyn ConnectionHandle>, EngineError>;
}

/// One open connection as the engine exposes it.
#[async_trait]
pub trait ConnectionHandle: SafeClose {
    async fn open_session(&self, timeout: Duration)
        -> Result<Arc<dyn SessionHandle>, EngineError>;

    /// Open the claims-based-security channel used for put-token
    /// exchanges. Engines may multiplex it over an internal session.
    async fn open_control_channel(
        &self,
        timeout: Duration,
    ) -> Result<Arc<dyn ControlChannel>, EngineError>;

    /// Signal flipping to `true` once the engine tears the connection
    /// down, whether locally initiated or peer initiated.
    fn subscribe_closed(&self) -> watch::Receiver<bool>;
}

/// One open session. Sessions are torn down with their parent connection.
#[async_trait]
pub trait SessionHandle: SafeClose {
    async fn open_link(
        &self,
        settings: &LinkSettings,
        timeout: Duration,
    ) -> Result<Arc<dyn LinkHandle>, EngineError>;
}

/// One attached link, either direction.
#[async_trait]
pub trait LinkHandle: SafeClose {
    /// Transmit one envelope untransacted and await its settlement.
    async fn send(
        &self,
        envelope: Envelope,
        tag: DeliveryTag,
        timeout: Duration,
    ) -> Result<Outcome, EngineError>;

    /// Await the next inbound delivery.
    async fn receive(&self, timeout: Duration) -> Result<(Envelope, DeliveryTag), EngineError>;

    /// Settle a received delivery with the given disposition.
    async fn disposition(
        &self,
        tag: &DeliveryTag,
        disposition: Disposition,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Signal flipping to `true` once the engine detaches the link.
    fn subscribe_closed(&self) -> watch::Receiver<bool>;
}

/// Claims-based-security channel for token exchanges.
#[async_trait]
pub trait ControlChannel: SafeClose {
    /// Present a token for `audience`. The broker extends the
    /// authorization window to the token's expiry on success.
    async fn put_token(
        &self,
        audience: &str,
        token: &SecurityToken,
        timeout: Duration,
    ) -> Result<(), EngineError>;
}
