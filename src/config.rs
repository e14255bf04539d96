//! Bridge configuration types and defaults.
//!
//! Everything environment-specific (trusted origins, timeouts, protocol event
//! names) is supplied here at construction time rather than hard-coded.

use crate::origin::OriginPattern;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default handshake timeout in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default per-call timeout in milliseconds
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default panel identifier announced in the ready event
pub const DEFAULT_PANEL_ID: &str = "panel";

/// Default name of the event announcing the panel is listening
pub const DEFAULT_READY_EVENT: &str = "ready";

/// Default name of the handshake response carrying initial context
pub const DEFAULT_INIT_RESPONSE: &str = "init";

/// Default name of the bare handshake acknowledgement
pub const DEFAULT_ACK_RESPONSE: &str = "ack";

/// Default name of the event that replaces the host context
pub const DEFAULT_CONTEXT_CHANGED_EVENT: &str = "context-changed";

/// Default maximum number of events buffered before the handshake completes
pub const DEFAULT_MAX_QUEUED_EVENTS: usize = 256;

/// Wildcard target origin
pub const WILDCARD_ORIGIN: &str = "*";

/// Configuration for the frame bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Identifier of this panel, sent with the ready event
    #[serde(default = "default_panel_id")]
    pub panel_id: String,

    /// Origins inbound messages are accepted from
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Origin outbound messages are addressed to
    #[serde(default)]
    pub target_origin: String,

    /// Permit `*` as the target origin (any parent can read outbound messages)
    #[serde(default)]
    pub allow_wildcard_target: bool,

    /// Permit `*` in the allow-list (messages from any origin are trusted)
    #[serde(default)]
    pub allow_any_origin: bool,

    /// Handshake timeout in milliseconds (default: 5000)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Per-call timeout in milliseconds (default: 30000)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Name of the ready event sent on initialize
    #[serde(default = "default_ready_event")]
    pub ready_event: String,

    /// Name of the handshake response carrying initial context
    #[serde(default = "default_init_response")]
    pub init_response: String,

    /// Name of the bare handshake acknowledgement
    #[serde(default = "default_ack_response")]
    pub ack_response: String,

    /// Name of the event that replaces the host context snapshot
    #[serde(default = "default_context_changed_event")]
    pub context_changed_event: String,

    /// Maximum events buffered while the handshake is in progress
    #[serde(default = "default_max_queued_events")]
    pub max_queued_events: usize,

    /// Log dropped messages (untrusted, malformed, late) at warn instead of debug
    #[serde(default)]
    pub audit_dropped: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            panel_id: DEFAULT_PANEL_ID.to_string(),
            allowed_origins: Vec::new(),
            target_origin: String::new(),
            allow_wildcard_target: false,
            allow_any_origin: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            ready_event: DEFAULT_READY_EVENT.to_string(),
            init_response: DEFAULT_INIT_RESPONSE.to_string(),
            ack_response: DEFAULT_ACK_RESPONSE.to_string(),
            context_changed_event: DEFAULT_CONTEXT_CHANGED_EVENT.to_string(),
            max_queued_events: DEFAULT_MAX_QUEUED_EVENTS,
            audit_dropped: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration trusting exactly one host origin, both ways
    pub fn for_origin(origin: impl Into<String>) -> Self {
        let origin = origin.into();
        Self {
            allowed_origins: vec![origin.clone()],
            target_origin: origin,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Set the panel id
    pub fn with_panel_id(mut self, panel_id: impl Into<String>) -> Self {
        self.panel_id = panel_id.into();
        self
    }

    /// Add an allowed inbound origin
    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Set the outbound target origin
    pub fn with_target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = origin.into();
        self
    }

    /// Allow or forbid the wildcard target origin
    pub fn with_wildcard_target(mut self, allow: bool) -> Self {
        self.allow_wildcard_target = allow;
        self
    }

    /// Allow or forbid `*` in the inbound allow-list
    pub fn with_any_origin(mut self, allow: bool) -> Self {
        self.allow_any_origin = allow;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Set the per-call timeout
    pub fn with_call_timeout(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Set the context-changed event name
    pub fn with_context_changed_event(mut self, name: impl Into<String>) -> Self {
        self.context_changed_event = name.into();
        self
    }

    /// Set the pre-handshake event queue bound
    pub fn with_max_queued_events(mut self, max: usize) -> Self {
        self.max_queued_events = max;
        self
    }

    /// Enable or disable audit logging of dropped messages
    pub fn with_audit_dropped(mut self, audit: bool) -> Self {
        self.audit_dropped = audit;
        self
    }

    /// Parse the allow-list into origin patterns
    pub fn origin_patterns(&self) -> Result<Vec<OriginPattern>, ConfigError> {
        self.allowed_origins
            .iter()
            .map(|raw| {
                OriginPattern::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
                    field: "allowed_origins".into(),
                    reason: format!("'{}' is not a valid origin pattern", raw),
                })
            })
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::MissingField {
                field: "allowed_origins".into(),
            });
        }
        let patterns = self.origin_patterns()?;
        if !self.allow_any_origin && patterns.contains(&OriginPattern::Any) {
            return Err(ConfigError::InvalidValue {
                field: "allowed_origins".into(),
                reason: "'*' requires allow_any_origin".into(),
            });
        }

        if self.target_origin.is_empty() {
            return Err(ConfigError::MissingField {
                field: "target_origin".into(),
            });
        }

        if self.target_origin == WILDCARD_ORIGIN {
            if !self.allow_wildcard_target {
                return Err(ConfigError::InvalidValue {
                    field: "target_origin".into(),
                    reason: "wildcard target requires allow_wildcard_target".into(),
                });
            }
        } else if !matches!(
            OriginPattern::parse(&self.target_origin),
            Some(OriginPattern::Exact(_))
        ) {
            return Err(ConfigError::InvalidValue {
                field: "target_origin".into(),
                reason: format!("'{}' is not a concrete origin", self.target_origin),
            });
        }

        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        for (field, value) in [
            ("ready_event", &self.ready_event),
            ("init_response", &self.init_response),
            ("ack_response", &self.ack_response),
            ("context_changed_event", &self.context_changed_event),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: "must not be empty".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_panel_id() -> String {
    DEFAULT_PANEL_ID.to_string()
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_ready_event() -> String {
    DEFAULT_READY_EVENT.to_string()
}

fn default_init_response() -> String {
    DEFAULT_INIT_RESPONSE.to_string()
}

fn default_ack_response() -> String {
    DEFAULT_ACK_RESPONSE.to_string()
}

fn default_context_changed_event() -> String {
    DEFAULT_CONTEXT_CHANGED_EVENT.to_string()
}

fn default_max_queued_events() -> usize {
    DEFAULT_MAX_QUEUED_EVENTS
}
