//! Structured message units handed to the protocol engine
//!
//! An [`Envelope`] is the transport-level unit of transmission: body plus
//! ids, annotations, and application properties. Byte-level encoding of an
//! envelope into wire sections is the engine's job; this crate only decides
//! what goes into one. [`Message`] and [`MethodResponse`] are the
//! device-facing values that convert into envelopes, and the twin
//! constructors build the annotation-tagged envelopes the twin endpoint
//! expects.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Annotation key naming the twin operation.
pub const ANNOTATION_OPERATION: &str = "operation";
/// Annotation key naming the twin resource path.
pub const ANNOTATION_RESOURCE: &str = "resource";
/// Annotation key for the twin document version.
pub const ANNOTATION_VERSION: &str = "version";

/// Application property carrying a method response status code.
pub const PROPERTY_STATUS: &str = "status";

/// Twin resource path for reported properties.
pub const REPORTED_PROPERTIES_RESOURCE: &str = "/properties/reported";
/// Twin resource path for desired-property change notifications.
pub const DESIRED_NOTIFICATIONS_RESOURCE: &str = "/notifications/twin/properties/desired";

/// Property or annotation value on an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// Explicitly null. Distinct from an absent key.
    Null,
    String(String),
    Int(i64),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

/// Envelope body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    /// One opaque payload.
    Data(Bytes),
    /// A merged batch. Each element was converted from its own message
    /// first; the batch variant itself is the batched-format marker the
    /// engine acts on when encoding.
    Batch(Vec<Envelope>),
}

/// The unit of transmission handed to [`crate::engine::LinkHandle::send`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub annotations: BTreeMap<String, PropertyValue>,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub body: Body,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.annotations.insert(key.into(), value);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.application_properties.insert(key.into(), value);
        self
    }
}

/// A telemetry message as the device layer sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub body: Bytes,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Message with a JSON body and content type set accordingly.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self {
            body: Bytes::from(body),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        })
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Convert into the envelope the engine transmits.
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            message_id: self.message_id,
            correlation_id: None,
            content_type: self.content_type,
            annotations: BTreeMap::new(),
            application_properties: self.properties,
            body: if self.body.is_empty() {
                Body::Empty
            } else {
                Body::Data(self.body)
            },
        }
    }
}

/// Merge messages into one batch envelope.
///
/// Every message is converted into its own envelope first, so per-message
/// ids and properties survive inside the batch. Settlement of the batch is
/// all-or-nothing: the broker reports one outcome for the whole envelope.
pub fn batch_envelope(messages: Vec<Message>) -> Envelope {
    let sections = messages.into_iter().map(Message::into_envelope).collect();
    Envelope::new().with_body(Body::Batch(sections))
}

/// Response to a direct method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    /// Request id from the method invocation; becomes the correlation id.
    pub request_id: String,
    /// Numeric status the device reports for the invocation.
    pub status: i32,
    /// Serialized response payload, possibly empty.
    pub body: Bytes,
}

impl MethodResponse {
    pub fn new(request_id: impl Into<String>, status: i32, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            body: body.into(),
        }
    }

    /// Convert into the envelope the engine transmits: correlation id set
    /// to the request id, status carried as an application property.
    pub fn into_envelope(self) -> Envelope {
        let body = if self.body.is_empty() {
            Body::Empty
        } else {
            Body::Data(self.body)
        };
        Envelope::new()
            .with_correlation_id(self.request_id)
            .with_property(PROPERTY_STATUS, PropertyValue::Int(self.status as i64))
            .with_body(body)
    }
}

/// Envelope requesting the full twin document.
pub fn twin_get_envelope(correlation_id: impl Into<String>) -> Envelope {
    Envelope::new()
        .with_correlation_id(correlation_id)
        .with_annotation(ANNOTATION_OPERATION, PropertyValue::from("GET"))
}

/// Envelope patching reported properties. `reported` is the serialized
/// reported-properties document.
pub fn twin_patch_envelope(correlation_id: impl Into<String>, reported: Bytes) -> Envelope {
    Envelope::new()
        .with_correlation_id(correlation_id)
        .with_annotation(ANNOTATION_OPERATION, PropertyValue::from("PATCH"))
        .with_annotation(
            ANNOTATION_RESOURCE,
            PropertyValue::from(REPORTED_PROPERTIES_RESOURCE),
        )
        .with_annotation(ANNOTATION_VERSION, PropertyValue::Null)
        .with_body(Body::Data(reported))
}

/// Envelope subscribing to desired-property change notifications.
pub fn desired_properties_envelope(correlation_id: impl Into<String>) -> Envelope {
    Envelope::new()
        .with_correlation_id(correlation_id)
        .with_annotation(ANNOTATION_OPERATION, PropertyValue::from("PUT"))
        .with_annotation(
            ANNOTATION_RESOURCE,
            PropertyValue::from(DESIRED_NOTIFICATIONS_RESOURCE),
        )
        .with_annotation(ANNOTATION_VERSION, PropertyValue::Null)
}
