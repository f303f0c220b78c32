//! Observability support
//!
//! The core emits structured `tracing` events at state transitions,
//! classified failures, and renewal scheduling; this module provides the
//! subscriber setup a host process installs to see them. No component
//! depends on a subscriber being present.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
