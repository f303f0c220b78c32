//! Sending and receiving link operations
//!
//! A [`SendingLink`] carries telemetry, method responses, and twin
//! requests; a [`ReceivingLink`] yields inbound deliveries and settles
//! them. Both wrap one engine link handle and run every operation through
//! the same shape: fail fast if closing, drive the engine under the
//! caller's timeout, classify on failure. When the classifier flags
//! resource exhaustion the link itself is torn down before the failure
//! surfaces, so a caller never holds a half-open link after such an error.
//!
//! Concurrent sends on one link are allowed; settlement order is the
//! broker's to decide.

use crate::classify::recover;
use crate::engine::{DeliveryTag, LinkHandle};
use crate::envelope::{
    batch_envelope, desired_properties_envelope, twin_get_envelope, twin_patch_envelope, Envelope,
    Message, MethodResponse,
};
use crate::error::{Result, TransportError};
use crate::events::{ClosedEvent, ClosedSubscription};
use crate::outcome::{Disposition, Outcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct LinkCore {
    handle: Arc<dyn LinkHandle>,
    closed: Arc<ClosedEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LinkCore {
    fn new(handle: Arc<dyn LinkHandle>) -> Self {
        let closed = Arc::new(ClosedEvent::new());

        let mut engine_closed = handle.subscribe_closed();
        let event = Arc::clone(&closed);
        let monitor = tokio::spawn(async move {
            if engine_closed.wait_for(|closed| *closed).await.is_ok() {
                if event.fire() {
                    warn!("link detached by the transport");
                }
            }
        });

        Self {
            handle,
            closed,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    fn is_closing(&self) -> bool {
        self.closed.has_fired() || self.handle.is_closing()
    }

    async fn safe_close(&self) {
        self.handle.safe_close().await;
        self.closed.fire();
    }
}

impl Drop for LinkCore {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Outbound link: telemetry, method responses, and twin requests.
pub struct SendingLink {
    core: LinkCore,
}

impl std::fmt::Debug for SendingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendingLink").finish_non_exhaustive()
    }
}

impl SendingLink {
    pub(crate) fn new(handle: Arc<dyn LinkHandle>) -> Self {
        Self {
            core: LinkCore::new(handle),
        }
    }

    /// Send one telemetry message and return the broker's outcome as-is.
    pub async fn send_message(&self, message: Message, timeout: Duration) -> Result<Outcome> {
        self.send_envelope(message.into_envelope(), timeout).await
    }

    /// Send messages merged into one batch envelope.
    ///
    /// The batch travels as a single delivery with a single fresh tag, so
    /// settlement is all-or-nothing: anything but acceptance fails the
    /// whole call with the broker's error detail. An empty batch fails
    /// locally; there is nothing to transmit.
    pub async fn send_message_batch(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<Outcome> {
        if messages.is_empty() {
            return Err(TransportError::communication(
                "cannot send an empty message batch",
            ));
        }
        let count = messages.len();
        let outcome = self.send_envelope(batch_envelope(messages), timeout).await?;
        debug!(count, disposition = ?outcome.disposition(), "batch settled");
        outcome.ensure_accepted()
    }

    /// Send a direct-method response and return the raw outcome.
    pub async fn send_method_response(
        &self,
        response: MethodResponse,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.send_envelope(response.into_envelope(), timeout).await
    }

    /// Request the full twin document. The response arrives out-of-band;
    /// the caller correlates it by `correlation_id`.
    pub async fn send_twin_get(
        &self,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.send_envelope(twin_get_envelope(correlation_id), timeout)
            .await
    }

    /// Patch reported twin properties with the JSON serialization of
    /// `reported`. The response arrives out-of-band.
    pub async fn send_twin_patch<T: serde::Serialize>(
        &self,
        correlation_id: impl Into<String>,
        reported: &T,
        timeout: Duration,
    ) -> Result<Outcome> {
        let body = serde_json::to_vec(reported).map_err(|e| {
            TransportError::communication(format!("cannot serialize reported properties: {e}"))
        })?;
        self.send_envelope(twin_patch_envelope(correlation_id, body.into()), timeout)
            .await
    }

    /// Subscribe to desired-property change notifications. Notifications
    /// arrive out-of-band on the twin receiving link.
    pub async fn subscribe_to_desired_properties(
        &self,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.send_envelope(desired_properties_envelope(correlation_id), timeout)
            .await
    }

    /// Common send primitive every operation funnels through.
    async fn send_envelope(&self, envelope: Envelope, timeout: Duration) -> Result<Outcome> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot send on a closing link",
            ));
        }
        let tag = DeliveryTag::random();
        match self.core.handle.send(envelope, tag, timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(raw) => Err(recover(raw, &self.core).await),
        }
    }

    /// Best-effort teardown. Idempotent, never fails.
    pub async fn safe_close(&self) {
        self.core.safe_close().await;
    }

    /// Whether teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.core.is_closing()
    }

    /// Subscribe to the closed notification; it resolves exactly once.
    pub fn subscribe_closed(&self) -> ClosedSubscription {
        self.core.closed.subscribe()
    }
}

// The classifier's recovery target for a link is the wrapper, not the raw
// handle, so an exhaustion-forced close also fires the closed event.
#[async_trait::async_trait]
impl crate::engine::SafeClose for LinkCore {
    async fn safe_close(&self) {
        LinkCore::safe_close(self).await;
    }

    fn is_closing(&self) -> bool {
        LinkCore::is_closing(self)
    }
}

/// One inbound delivery with the broker-assigned tag needed to settle it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub delivery_tag: DeliveryTag,
}

/// Inbound link: deliveries plus their settlement.
pub struct ReceivingLink {
    core: LinkCore,
}

impl std::fmt::Debug for ReceivingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivingLink").finish_non_exhaustive()
    }
}

impl ReceivingLink {
    pub(crate) fn new(handle: Arc<dyn LinkHandle>) -> Self {
        Self {
            core: LinkCore::new(handle),
        }
    }

    /// Await the next inbound delivery.
    pub async fn receive_message(&self, timeout: Duration) -> Result<ReceivedMessage> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot receive on a closing link",
            ));
        }
        match self.core.handle.receive(timeout).await {
            Ok((envelope, delivery_tag)) => Ok(ReceivedMessage {
                envelope,
                delivery_tag,
            }),
            Err(raw) => Err(recover(raw, &self.core).await),
        }
    }

    /// Settle a delivery as accepted.
    pub async fn complete(&self, received: &ReceivedMessage, timeout: Duration) -> Result<()> {
        self.settle(received, Disposition::Accepted, timeout).await
    }

    /// Release a delivery back to the broker for redelivery.
    pub async fn abandon(&self, received: &ReceivedMessage, timeout: Duration) -> Result<()> {
        self.settle(received, Disposition::Released, timeout).await
    }

    /// Settle a delivery as rejected (unprocessable).
    pub async fn reject(&self, received: &ReceivedMessage, timeout: Duration) -> Result<()> {
        self.settle(received, Disposition::Rejected, timeout).await
    }

    async fn settle(
        &self,
        received: &ReceivedMessage,
        disposition: Disposition,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot settle on a closing link",
            ));
        }
        match self
            .core
            .handle
            .disposition(&received.delivery_tag, disposition, timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(raw) => Err(recover(raw, &self.core).await),
        }
    }

    /// Best-effort teardown. Idempotent, never fails.
    pub async fn safe_close(&self) {
        self.core.safe_close().await;
    }

    /// Whether teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.core.is_closing()
    }

    /// Subscribe to the closed notification; it resolves exactly once.
    pub fn subscribe_closed(&self) -> ClosedSubscription {
        self.core.closed.subscribe()
    }
}
