//! Transport-session core for an IoT device client
//!
//! This crate owns one logical connection to a message broker, multiplexes
//! it into sessions and links, keeps the connection authenticated through
//! a continuously refreshed security token, and translates raw transport
//! failures into a small taxonomy upper layers can act on.
//!
//! # Overview
//!
//! Ownership is strict: a [`Connection`] creates [`Session`]s, a session
//! attaches [`SendingLink`]s and [`ReceivingLink`]s, and an
//! [`AuthenticationRefresher`] runs against the connection's control
//! channel until its owner tears it down. Every operation follows the same
//! policy: fail fast when the owner is closing, drive the engine under the
//! caller's timeout, and classify failures once at the call site that
//! caught them.
//!
//! The wire protocol itself lives behind the capability traits in
//! [`engine`]; this crate never names a concrete engine.
//!
//! # Quick Start
//!
//! ```no_run
//! use hublink::{
//!     Connection, DeviceIdentity, LinkSettings, Message, SecurityToken,
//!     StaticTokenProvider, TransportConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(engine: &dyn hublink::engine::ProtocolEngine) -> hublink::Result<()> {
//! let token = SecurityToken::new(
//!     "SharedAccessSignature ...",
//!     chrono::Utc::now() + chrono::Duration::hours(1),
//! );
//! let identity = DeviceIdentity::for_device(
//!     "contoso.example.net",
//!     "device-1",
//!     Arc::new(StaticTokenProvider::new(token)),
//! );
//!
//! let timeout = Duration::from_secs(30);
//! let config = TransportConfig::default();
//! let connection = Connection::open(engine, &identity, &config, timeout).await?;
//! let refresher = connection.create_refresher(&identity, timeout).await?;
//!
//! let session = connection.open_session(timeout).await?;
//! let link = session
//!     .open_sending_link(
//!         LinkSettings::sender("telemetry", "/devices/device-1/messages/events"),
//!         timeout,
//!     )
//!     .await?;
//!
//! let outcome = link.send_message(Message::new("t=21.5"), timeout).await?;
//! assert!(outcome.is_accepted());
//!
//! refresher.cancel();
//! connection.safe_close().await;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod connection;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod link;
pub mod observability;
pub mod outcome;
pub mod refresher;
pub mod session;
pub mod testing;

pub use classify::{classify, Classification};
pub use config::{ConfigError, TokenPolicy, TransportConfig};
pub use connection::Connection;
pub use engine::{DeliveryTag, LinkRole, LinkSettings, SafeClose};
pub use envelope::{Body, Envelope, Message, MethodResponse, PropertyValue};
pub use error::{EngineError, ErrorCondition, Result, TransportError};
pub use events::ClosedSubscription;
pub use identity::{DeviceIdentity, SecurityToken, StaticTokenProvider, TokenProvider};
pub use link::{ReceivedMessage, ReceivingLink, SendingLink};
pub use outcome::{Disposition, Outcome, OutcomeError};
pub use refresher::{AuthenticationRefresher, RefresherState};
pub use session::Session;
