//! Settlement outcomes for sent deliveries
//!
//! The broker settles every delivery with one of four dispositions. Most
//! send operations return the [`Outcome`] untouched and let the caller
//! decide what a non-accepted settlement means; batch sends call
//! [`Outcome::ensure_accepted`] because a batch settles as a single
//! delivery and anything but acceptance fails the whole batch.

use crate::classify::{classify, Classification};
use crate::error::{EngineError, ErrorCondition, Result, TransportError};

/// How the broker settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The delivery was accepted.
    Accepted,
    /// The delivery was rejected as unprocessable; error detail applies.
    Rejected,
    /// The broker released the delivery without processing it.
    Released,
    /// The broker modified and did not process the delivery.
    Modified,
}

/// Error detail attached to a non-accepted settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeError {
    pub condition: ErrorCondition,
    pub description: String,
}

impl OutcomeError {
    pub fn new(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self {
            condition,
            description: description.into(),
        }
    }
}

/// Result of one settled delivery: disposition plus optional error detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    disposition: Disposition,
    error: Option<OutcomeError>,
}

impl Outcome {
    pub fn accepted() -> Self {
        Self {
            disposition: Disposition::Accepted,
            error: None,
        }
    }

    pub fn rejected(error: OutcomeError) -> Self {
        Self {
            disposition: Disposition::Rejected,
            error: Some(error),
        }
    }

    /// Rejected settlement whose error detail got lost in transit.
    pub fn rejected_without_detail() -> Self {
        Self {
            disposition: Disposition::Rejected,
            error: None,
        }
    }

    pub fn released() -> Self {
        Self {
            disposition: Disposition::Released,
            error: None,
        }
    }

    pub fn modified() -> Self {
        Self {
            disposition: Disposition::Modified,
            error: None,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn error(&self) -> Option<&OutcomeError> {
        self.error.as_ref()
    }

    pub fn is_accepted(&self) -> bool {
        self.disposition == Disposition::Accepted
    }

    /// Fail unless the delivery was accepted.
    ///
    /// Rejection detail is translated through the same classification
    /// table engine failures use, so a rejected-as-unauthorized batch
    /// surfaces as [`TransportError::Unauthorized`] and an unrecognized
    /// rejection keeps its original condition via
    /// [`TransportError::Engine`]. A non-accepted outcome never tears the
    /// link down; only classified engine failures do that.
    pub fn ensure_accepted(self) -> Result<Outcome> {
        match self.disposition {
            Disposition::Accepted => Ok(self),
            Disposition::Rejected => match self.error {
                Some(detail) => {
                    let raw = EngineError::condition(detail.condition, detail.description);
                    Err(match classify(&raw) {
                        Classification::Unauthorized => {
                            TransportError::unauthorized(raw.to_string())
                        }
                        Classification::Communication | Classification::ResourceExhausted => {
                            TransportError::communication(raw.to_string())
                        }
                        Classification::PassThrough => TransportError::Engine(raw),
                    })
                }
                None => Err(TransportError::communication(
                    "delivery rejected without error detail",
                )),
            },
            Disposition::Released => Err(TransportError::communication(
                "delivery released by the broker",
            )),
            Disposition::Modified => Err(TransportError::communication(
                "delivery modified by the broker",
            )),
        }
    }
}
