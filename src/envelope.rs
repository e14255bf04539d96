//! Envelope protocol.
//!
//! Every message exchanged with the host is an envelope: a JSON object with a
//! `kind` (`request`, `response` or `event`), a `name`, an opaque `payload`,
//! a correlation `id` for request/response pairs, and an optional `error`
//! on responses.
//!
//! Encoding is deterministic and decoding is strict: an envelope missing a
//! required field is rejected as a whole rather than partially accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Expects exactly one response with the same id
    Request,
    /// Answers the request with the same id
    Response,
    /// Fire-and-forget notification
    Event,
}

impl EnvelopeKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Event => "event",
        }
    }

    /// Whether envelopes of this kind must carry a correlation id
    pub fn requires_id(&self) -> bool {
        !matches!(self, EnvelopeKind::Event)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(EnvelopeKind::Request),
            "response" => Ok(EnvelopeKind::Response),
            "event" => Ok(EnvelopeKind::Event),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// Reasons an inbound message is not a valid envelope
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not parseable as JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// JSON, but not an object
    #[error("envelope must be a JSON object")]
    NotAnObject,

    /// A required field is absent
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A field has the wrong JSON type
    #[error("field '{field}' must be a {expected}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
    },

    /// `kind` is not one of the known kinds
    #[error("unknown envelope kind '{0}'")]
    UnknownKind(String),

    /// `name` is present but empty
    #[error("envelope name must not be empty")]
    EmptyName,
}

/// A single bridge message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id (required for requests and responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Envelope kind
    pub kind: EnvelopeKind,

    /// Method name for requests/responses, event name for events
    pub name: String,

    /// Opaque payload
    #[serde(default)]
    pub payload: Value,

    /// Error text (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Create a request envelope
    pub fn request(id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: EnvelopeKind::Request,
            name: name.into(),
            payload,
            error: None,
        }
    }

    /// Create a successful response envelope
    pub fn response(id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: EnvelopeKind::Response,
            name: name.into(),
            payload,
            error: None,
        }
    }

    /// Create an error response envelope
    pub fn error_response(
        id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            kind: EnvelopeKind::Response,
            name: name.into(),
            payload: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Create an event envelope
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: EnvelopeKind::Event,
            name: name.into(),
            payload,
            error: None,
        }
    }

    /// Attach a correlation id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Check structural validity
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.name.is_empty() {
            return Err(DecodeError::EmptyName);
        }
        if self.kind.requires_id() && self.id.as_deref().map_or(true, str::is_empty) {
            return Err(DecodeError::MissingField("id"));
        }
        Ok(())
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode from an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = take_string(&mut obj, "kind")?
            .ok_or(DecodeError::MissingField("kind"))?
            .parse::<EnvelopeKind>()?;
        let name = take_string(&mut obj, "name")?.ok_or(DecodeError::MissingField("name"))?;
        let id = take_string(&mut obj, "id")?;
        let error = take_string(&mut obj, "error")?;
        let payload = obj.remove("payload").unwrap_or(Value::Null);

        let envelope = Self {
            id,
            kind,
            name,
            payload,
            error,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Whether this is a response carrying an error
    pub fn is_error(&self) -> bool {
        self.kind == EnvelopeKind::Response && self.error.is_some()
    }
}

fn take_string(obj: &mut Map<String, Value>, field: &'static str) -> Result<Option<String>, DecodeError> {
    match obj.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(DecodeError::InvalidField {
            field,
            expected: "string",
        }),
    }
}
