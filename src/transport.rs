//! Transport adapter.
//!
//! The adapter is the only part of the bridge that touches the parent frame.
//! Outbound envelopes are encoded and posted to the configured target origin;
//! inbound raw messages are origin-checked and decoded, and anything
//! untrusted or malformed is dropped here so it never reaches the driver.

use crate::config::{BridgeConfig, ConfigError};
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::metrics::{DropReason, MetricsCollector};
use crate::origin::OriginPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A message as delivered by the host window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Origin reported for the sender
    pub origin: String,
    /// Serialized envelope
    pub data: String,
}

impl RawMessage {
    /// Create a raw message
    pub fn new(origin: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            data: data.into(),
        }
    }

    /// Encode an envelope as if sent from `origin`
    pub fn from_envelope(origin: impl Into<String>, envelope: &Envelope) -> Result<Self> {
        Ok(Self::new(origin, envelope.encode()?))
    }
}

/// A message posted to the parent frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Origin the message is addressed to
    pub target_origin: String,
    /// Serialized envelope
    pub data: String,
}

impl OutboundMessage {
    /// Decode the carried envelope
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope::decode(&self.data)?)
    }
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The parent frame is gone
    #[error("parent frame disconnected")]
    Disconnected,

    /// The platform refused the message
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// The cross-document messaging primitive
pub trait Transport: Send + Sync {
    /// Post serialized data to the parent frame
    fn post_message(&self, data: String, target_origin: &str) -> std::result::Result<(), TransportError>;
}

/// Transport backed by an unbounded channel
///
/// Used when the parent side lives in the same process (native embedding,
/// tests): every posted message is forwarded to the paired receiver.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing its output
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn post_message(&self, data: String, target_origin: &str) -> std::result::Result<(), TransportError> {
        self.tx
            .send(OutboundMessage {
                target_origin: target_origin.to_string(),
                data,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Origin-checking, encoding wrapper around a [`Transport`]
pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    target_origin: String,
    policy: OriginPolicy,
    audit_dropped: bool,
    metrics: Arc<MetricsCollector>,
}

impl TransportAdapter {
    /// Create an adapter from validated configuration
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &BridgeConfig,
        metrics: Arc<MetricsCollector>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        if config.allow_wildcard_target && config.target_origin == crate::config::WILDCARD_ORIGIN {
            warn!("Outbound messages use wildcard target origin; any parent can read them");
        }
        if config.allow_any_origin && config.allowed_origins.iter().any(|o| o == crate::config::WILDCARD_ORIGIN) {
            warn!("Inbound allow-list contains '*'; messages from any origin are trusted");
        }

        Ok(Self {
            transport,
            target_origin: config.target_origin.clone(),
            policy: OriginPolicy::new(config.origin_patterns()?),
            audit_dropped: config.audit_dropped,
            metrics,
        })
    }

    /// Encode and post an envelope to the parent frame
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let data = envelope.encode()?;
        trace!(kind = %envelope.kind, name = %envelope.name, "Posting envelope");
        self.transport
            .post_message(data, &self.target_origin)
            .map_err(BridgeError::from)
    }

    /// Validate and decode a raw inbound message
    pub fn check(&self, raw: &RawMessage) -> Result<Envelope> {
        if !self.policy.allows(&raw.origin) {
            return Err(BridgeError::UntrustedOrigin(raw.origin.clone()));
        }
        Ok(Envelope::decode(&raw.data)?)
    }

    /// Accept a raw inbound message, dropping anything untrusted or malformed
    pub fn receive(&self, raw: &RawMessage) -> Option<Envelope> {
        match self.check(raw) {
            Ok(envelope) => {
                self.metrics.record_inbound();
                Some(envelope)
            }
            Err(err) => {
                let reason = match err {
                    BridgeError::UntrustedOrigin(_) => DropReason::UntrustedOrigin,
                    _ => DropReason::DecodeError,
                };
                self.metrics.record_drop(reason);
                self.log_dropped(reason, &raw.origin, &err.to_string());
                None
            }
        }
    }

    /// Log a discarded message at the configured verbosity
    pub fn log_dropped(&self, reason: DropReason, origin: &str, detail: &str) {
        if self.audit_dropped {
            warn!(reason = reason.as_str(), origin = %origin, "Dropped inbound message: {}", detail);
        } else {
            debug!(reason = reason.as_str(), origin = %origin, "Dropped inbound message: {}", detail);
        }
    }

    /// The origin outbound messages are addressed to
    pub fn target_origin(&self) -> &str {
        &self.target_origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use serde_json::json;

    const HOST: &str = "https://console.dataloop.ai";

    fn create_adapter() -> (
        TransportAdapter,
        mpsc::UnboundedReceiver<OutboundMessage>,
        Arc<MetricsCollector>,
    ) {
        let (transport, rx) = ChannelTransport::new();
        let metrics = Arc::new(MetricsCollector::new());
        let adapter = TransportAdapter::new(
            Arc::new(transport),
            &BridgeConfig::for_origin(HOST),
            Arc::clone(&metrics),
        )
        .unwrap();
        (adapter, rx, metrics)
    }

    #[test]
    fn test_send_posts_to_target_origin() {
        let (adapter, mut rx, _) = create_adapter();
        adapter
            .send(&Envelope::event("status", json!({"loaded": true})))
            .unwrap();

        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.target_origin, HOST);
        let envelope = outbound.envelope().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Event);
        assert_eq!(envelope.name, "status");
    }

    #[test]
    fn test_send_after_disconnect() {
        let (adapter, rx, _) = create_adapter();
        drop(rx);
        let result = adapter.send(&Envelope::event("status", json!(null)));
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn test_receive_trusted() {
        let (adapter, _rx, metrics) = create_adapter();
        let raw = RawMessage::from_envelope(HOST, &Envelope::event("selection", json!([1]))).unwrap();
        let envelope = adapter.receive(&raw).unwrap();
        assert_eq!(envelope.name, "selection");
        assert_eq!(metrics.dropped(DropReason::UntrustedOrigin), 0);
    }

    #[test]
    fn test_receive_untrusted_is_dropped() {
        let (adapter, _rx, metrics) = create_adapter();
        let raw = RawMessage::from_envelope(
            "https://evil.example",
            &Envelope::event("selection", json!([1])),
        )
        .unwrap();

        assert!(adapter.receive(&raw).is_none());
        assert!(matches!(
            adapter.check(&raw),
            Err(BridgeError::UntrustedOrigin(ref o)) if o == "https://evil.example"
        ));
        assert_eq!(metrics.dropped(DropReason::UntrustedOrigin), 1);
    }

    #[test]
    fn test_receive_malformed_is_dropped() {
        let (adapter, _rx, metrics) = create_adapter();
        assert!(adapter.receive(&RawMessage::new(HOST, "{\"kind\":")).is_none());
        assert!(adapter
            .receive(&RawMessage::new(HOST, r#"{"kind":"request","name":"x"}"#))
            .is_none());
        assert_eq!(metrics.dropped(DropReason::DecodeError), 2);
    }

    #[test]
    fn test_any_origin_allow_list() {
        let (transport, _rx) = ChannelTransport::new();
        let metrics = Arc::new(MetricsCollector::new());
        let config = BridgeConfig::for_origin(HOST).with_allowed_origin("*");
        assert!(TransportAdapter::new(Arc::new(transport.clone()), &config, Arc::clone(&metrics)).is_err());

        let adapter = TransportAdapter::new(
            Arc::new(transport),
            &config.with_any_origin(true),
            Arc::clone(&metrics),
        )
        .unwrap();
        let raw = RawMessage::from_envelope("https://other.example", &Envelope::event("tick", json!(1)))
            .unwrap();
        assert!(adapter.receive(&raw).is_some());
    }

    #[test]
    fn test_adapter_rejects_invalid_config() {
        let (transport, _rx) = ChannelTransport::new();
        let result = TransportAdapter::new(
            Arc::new(transport),
            &BridgeConfig::for_origin(HOST).with_target_origin("*"),
            Arc::new(MetricsCollector::new()),
        );
        assert!(result.is_err());
    }
}
