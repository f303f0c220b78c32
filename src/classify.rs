//! Centralized failure classification and recovery
//!
//! Every engine call site in this crate funnels raw failures through the
//! same policy: [`classify`] decides what kind of failure it is, and
//! [`recover`] runs the recovery action that kind requires before the
//! failure is surfaced as a [`TransportError`]. Dispatch lives here, in one
//! place, instead of being re-derived at each call site.

use crate::engine::SafeClose;
use crate::error::{EngineError, ErrorCondition, TransportError};
use tracing::warn;

/// What the classifier concluded about a raw engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Credential or token rejected. Not retryable with the same credential.
    Unauthorized,
    /// Transient transport failure. Retryable after reconnecting.
    Communication,
    /// Broker-side capacity exhaustion. The failing object must be torn
    /// down before the failure is surfaced; callers then see a
    /// communication failure.
    ResourceExhausted,
    /// Not recognized. The failure keeps its original identity.
    PassThrough,
}

/// Classify a raw engine failure.
///
/// Total over [`EngineError`]: every value maps to exactly one kind.
/// Process-fatal failures have no representation here by construction;
/// this crate never catches panics, so they propagate unclassified.
pub fn classify(error: &EngineError) -> Classification {
    match error {
        EngineError::Condition { condition, .. } => match condition {
            ErrorCondition::UnauthorizedAccess => Classification::Unauthorized,
            ErrorCondition::ResourceLimitExceeded => Classification::ResourceExhausted,
            ErrorCondition::ConnectionForced | ErrorCondition::DetachForced => {
                Classification::Communication
            }
            ErrorCondition::NotFound
            | ErrorCondition::MessageSizeExceeded
            | ErrorCondition::InternalError
            | ErrorCondition::Other(_) => Classification::PassThrough,
        },
        EngineError::Io(_) | EngineError::Timeout { .. } | EngineError::Aborted(_) => {
            Classification::Communication
        }
        EngineError::Other(_) => Classification::PassThrough,
    }
}

/// Classify a raw failure and run the recovery its kind requires.
///
/// `failed` is the object the operation ran on. On resource exhaustion its
/// total-close routine runs to completion before the communication failure
/// is returned, so no half-torn endpoint stays reachable. Unrecognized
/// failures return as [`TransportError::Engine`] carrying the original
/// value unchanged.
pub async fn recover(error: EngineError, failed: &dyn SafeClose) -> TransportError {
    match classify(&error) {
        Classification::Unauthorized => TransportError::unauthorized(error.to_string()),
        Classification::Communication => TransportError::communication(error.to_string()),
        Classification::ResourceExhausted => {
            warn!(error = %error, "resource exhaustion reported, closing the failing endpoint");
            failed.safe_close().await;
            TransportError::communication(error.to_string())
        }
        Classification::PassThrough => TransportError::Engine(error),
    }
}

/// Classify a raw failure where no recovery target exists yet, e.g. when
/// the connection itself failed to open. Exhaustion degenerates to a plain
/// communication failure because there is nothing to close.
pub fn surface(error: EngineError) -> TransportError {
    match classify(&error) {
        Classification::Unauthorized => TransportError::unauthorized(error.to_string()),
        Classification::Communication | Classification::ResourceExhausted => {
            TransportError::communication(error.to_string())
        }
        Classification::PassThrough => TransportError::Engine(error),
    }
}
