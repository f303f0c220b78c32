//! Session lifecycle
//!
//! A [`Session`] is a multiplexing context inside a connection: links are
//! attached to it, and the engine tears it down together with its parent.
//! Link creation follows the same fail-fast-then-classify shape as session
//! creation on the connection.

use crate::classify::recover;
use crate::engine::{LinkRole, LinkSettings, SessionHandle};
use crate::error::{Result, TransportError};
use crate::link::{ReceivingLink, SendingLink};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One open session over a connection.
pub struct Session {
    handle: Arc<dyn SessionHandle>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(handle: Arc<dyn SessionHandle>) -> Self {
        Self { handle }
    }

    /// Attach a sending link. The role in `settings` is forced to sender.
    pub async fn open_sending_link(
        &self,
        settings: LinkSettings,
        timeout: Duration,
    ) -> Result<SendingLink> {
        let settings = LinkSettings {
            role: LinkRole::Sender,
            ..settings
        };
        let handle = self.open_link(&settings, timeout).await?;
        Ok(SendingLink::new(handle))
    }

    /// Attach a receiving link. The role in `settings` is forced to
    /// receiver.
    pub async fn open_receiving_link(
        &self,
        settings: LinkSettings,
        timeout: Duration,
    ) -> Result<ReceivingLink> {
        let settings = LinkSettings {
            role: LinkRole::Receiver,
            ..settings
        };
        let handle = self.open_link(&settings, timeout).await?;
        Ok(ReceivingLink::new(handle))
    }

    async fn open_link(
        &self,
        settings: &LinkSettings,
        timeout: Duration,
    ) -> Result<Arc<dyn crate::engine::LinkHandle>> {
        if self.is_closing() {
            return Err(TransportError::communication(
                "cannot open a link on a closing session",
            ));
        }
        match self.handle.open_link(settings, timeout).await {
            Ok(link) => {
                debug!(name = settings.name, address = settings.address, "link open");
                Ok(link)
            }
            Err(raw) => Err(recover(raw, self.handle.as_ref()).await),
        }
    }

    /// Best-effort teardown. Idempotent, never fails.
    pub async fn safe_close(&self) {
        self.handle.safe_close().await;
    }

    /// Whether teardown has begun.
    pub fn is_closing(&self) -> bool {
        self.handle.is_closing()
    }
}
