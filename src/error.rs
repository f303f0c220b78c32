//! Error taxonomy for transport-session operations
//!
//! Raw protocol-engine failures surface as [`EngineError`]. Call sites route
//! them through the classifier (see [`crate::classify`]) exactly once, which
//! yields the small [`TransportError`] taxonomy that upper layers (retry
//! policy, device-client state machine) act on. Failures the classifier does
//! not recognize keep their original identity via [`TransportError::Engine`].

use std::time::Duration;
use thiserror::Error;

/// Symbolic failure conditions reported by the protocol engine.
///
/// Mirrors the wire-level condition symbols; engines map whatever their
/// framing layer reports into one of these before handing the failure up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    UnauthorizedAccess,
    ResourceLimitExceeded,
    ConnectionForced,
    DetachForced,
    NotFound,
    MessageSizeExceeded,
    InternalError,
    /// Any condition symbol this crate does not interpret.
    Other(String),
}

impl ErrorCondition {
    /// Wire symbol for this condition.
    pub fn symbol(&self) -> &str {
        match self {
            ErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            ErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            ErrorCondition::ConnectionForced => "amqp:connection:forced",
            ErrorCondition::DetachForced => "amqp:link:detach-forced",
            ErrorCondition::NotFound => "amqp:not-found",
            ErrorCondition::MessageSizeExceeded => "amqp:link:message-size-exceeded",
            ErrorCondition::InternalError => "amqp:internal-error",
            ErrorCondition::Other(symbol) => symbol,
        }
    }

    /// Map a wire symbol back to a condition. Unrecognized symbols are
    /// preserved verbatim in [`ErrorCondition::Other`].
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:unauthorized-access" => ErrorCondition::UnauthorizedAccess,
            "amqp:resource-limit-exceeded" => ErrorCondition::ResourceLimitExceeded,
            "amqp:connection:forced" => ErrorCondition::ConnectionForced,
            "amqp:link:detach-forced" => ErrorCondition::DetachForced,
            "amqp:not-found" => ErrorCondition::NotFound,
            "amqp:link:message-size-exceeded" => ErrorCondition::MessageSizeExceeded,
            "amqp:internal-error" => ErrorCondition::InternalError,
            other => ErrorCondition::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Raw failure reported by the protocol engine.
///
/// This enum is the entire vocabulary the classifier reasons over. Engines
/// must not panic to report operational failures; a panic is treated as
/// process-fatal and is never converted into this type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The peer (or the engine itself) reported a symbolic error condition.
    #[error("{condition}: {description}")]
    Condition {
        condition: ErrorCondition,
        description: String,
    },

    /// Socket-level failure underneath the protocol.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The operation did not settle within the caller-supplied budget.
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// The engine abandoned the operation, typically during local teardown.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// Anything the engine cannot express with the variants above.
    #[error("engine failure: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    /// Create a symbolic condition error.
    pub fn condition(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self::Condition {
            condition,
            description: description.into(),
        }
    }

    /// Create an unauthorized-access condition error.
    pub fn unauthorized_access(description: impl Into<String>) -> Self {
        Self::condition(ErrorCondition::UnauthorizedAccess, description)
    }

    /// Create a resource-limit-exceeded condition error.
    pub fn resource_limit_exceeded(description: impl Into<String>) -> Self {
        Self::condition(ErrorCondition::ResourceLimitExceeded, description)
    }

    /// Create a timeout error.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Create an aborted-operation error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Wrap an arbitrary engine-side failure.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(error))
    }
}

/// Failures surfaced to the device client by this crate.
///
/// `Unauthorized` and `Communication` are the two kinds the classifier
/// translates into; everything it does not recognize moves through
/// `Engine` with its original identity intact, so callers can still match
/// on the raw failure. Resource exhaustion never appears here: by the time
/// the failure is surfaced the exhausted object has been closed and the
/// caller sees a communication failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The credential or token was rejected. Retrying with the same
    /// credential cannot succeed.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The transport is disconnected, timed out, or was torn down.
    /// Retryable once connectivity is restored.
    #[error("communication failure: {message}")]
    Communication { message: String },

    /// An engine failure passed through unchanged.
    #[error(transparent)]
    Engine(EngineError),
}

impl TransportError {
    /// Create an unauthorized error. The message is redacted before it is
    /// stored.
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: redact_secrets(&message.into()),
        }
    }

    /// Create a communication error. The message is redacted before it is
    /// stored.
    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::Communication {
            message: redact_secrets(&message.into()),
        }
    }

    /// Whether the failure is worth retrying after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Communication { .. })
    }
}

/// Redact token material and other secrets from failure text.
///
/// Broker rejections frequently echo the offending authorization header
/// back; strip anything that looks like credentials before the message is
/// stored or logged.
pub(crate) fn redact_secrets(message: &str) -> String {
    let mut redacted = message.to_string();

    redacted =
        regex::Regex::new(r"(?i)(sharedaccesssignature|password|token|secret|key|sig)[=:]\s*\S+")
            .unwrap()
            .replace_all(&redacted, "${1}=***")
            .to_string();

    // Cap pathological message sizes so logs stay readable
    if redacted.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut max_content_len = 500 - truncate_suffix.len();
        // Back up to a char boundary; broker text is not always ASCII
        while !redacted.is_char_boundary(max_content_len) {
            max_content_len -= 1;
        }
        redacted = format!("{}{}", &redacted[..max_content_len], truncate_suffix);
    }

    redacted
}

/// Result type for transport-session operations.
pub type Result<T> = std::result::Result<T, TransportError>;
