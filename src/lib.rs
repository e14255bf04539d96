//! # Nexus Frame Bridge
//!
//! Message bridge between a panel running inside an embedded frame and the
//! host application that embeds it. The panel talks to the host over the
//! cross-document messaging primitive: request/response calls correlated by
//! id, fire-and-forget events, and a handshake that delivers the host
//! context.
//!
//! ## Architecture
//!
//! ```text
//! Host window
//!     │
//!     │ post_message (origin-checked)
//!     ▼
//! TransportAdapter ── Envelope decode
//!     │
//!     ▼
//! FrameDriver ─┬─ PendingCallRegistry (responses)
//!              ├─ EventBus            (events)
//!              └─ request handlers    (host requests)
//!     │
//!     ▼
//! HostProxy (application code)
//! ```
//!
//! ## Features
//!
//! - **Origin Allow-List**: Messages from untrusted origins never reach handlers
//! - **Correlated Calls**: Concurrent calls resolve independently, with timeouts
//! - **Handshake**: `initialize()` completes once the host context is known
//! - **Context Snapshots**: Host context is replaced whole, never torn

#![deny(missing_docs)]

pub mod config;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use config::{BridgeConfig, ConfigError};
pub use driver::{BridgeFuture, BridgeState, FrameDriver};
pub use envelope::{DecodeError, Envelope, EnvelopeKind};
pub use error::{BridgeError, ErrorCode, Result};
pub use events::{EventBus, Subscription};
pub use host::{HostContext, HostProxy, PanelStatus};
pub use metrics::{BridgeStats, DropReason};
pub use origin::{OriginPattern, OriginPolicy};
pub use transport::{ChannelTransport, OutboundMessage, RawMessage, Transport, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }
}
