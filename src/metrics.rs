//! Bridge metrics for monitoring and observability.
//!
//! Every call outcome, event and dropped message is counted here, so the
//! cases the bridge swallows on purpose (untrusted origins, malformed
//! envelopes, late responses) remain visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why an inbound message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Sender origin not in the allow-list
    UntrustedOrigin,
    /// Message was not a valid envelope
    DecodeError,
    /// Response for an id that is no longer pending
    LateResponse,
    /// Pre-handshake event queue was full
    QueueOverflow,
    /// Message arrived after the bridge closed
    Closed,
}

impl DropReason {
    /// Label used in metric output
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UntrustedOrigin => "untrusted_origin",
            DropReason::DecodeError => "decode_error",
            DropReason::LateResponse => "late_response",
            DropReason::QueueOverflow => "queue_overflow",
            DropReason::Closed => "closed",
        }
    }
}

/// Point-in-time statistics for one bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Current lifecycle state
    pub state: String,
    /// Calls currently awaiting a response
    pub pending_calls: usize,
    /// Registered event handlers
    pub subscriptions: usize,
    /// Requests sent to the host
    pub calls_sent: u64,
    /// Calls answered successfully
    pub calls_resolved: u64,
    /// Calls answered with an error
    pub calls_rejected: u64,
    /// Calls that timed out
    pub calls_timed_out: u64,
    /// Average round-trip time of answered calls in microseconds
    pub avg_call_time_us: f64,
    /// Events sent to the host
    pub events_emitted: u64,
    /// Inbound events delivered to handlers
    pub events_dispatched: u64,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
    /// Host requests answered by served methods
    pub requests_served: u64,
    /// Dropped inbound messages by reason
    pub dropped: HashMap<String, u64>,
    /// When the last trusted message arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Metrics collector for one bridge
pub struct MetricsCollector {
    calls_sent: AtomicU64,
    calls_resolved: AtomicU64,
    calls_rejected: AtomicU64,
    calls_timed_out: AtomicU64,
    total_call_time_us: AtomicU64,
    events_emitted: AtomicU64,
    events_dispatched: AtomicU64,
    handler_failures: AtomicU64,
    requests_served: AtomicU64,
    dropped: parking_lot::Mutex<HashMap<DropReason, u64>>,
    last_message_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            calls_sent: AtomicU64::new(0),
            calls_resolved: AtomicU64::new(0),
            calls_rejected: AtomicU64::new(0),
            calls_timed_out: AtomicU64::new(0),
            total_call_time_us: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            dropped: parking_lot::Mutex::new(HashMap::new()),
            last_message_at: parking_lot::Mutex::new(None),
        }
    }

    /// Record a request sent to the host
    pub fn record_call_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful response and its round-trip time
    pub fn record_call_resolved(&self, elapsed: Duration) {
        self.calls_resolved.fetch_add(1, Ordering::Relaxed);
        self.total_call_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record an error response
    pub fn record_call_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call timeout
    pub fn record_call_timed_out(&self) {
        self.calls_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound event
    pub fn record_event_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound event delivered to handlers
    pub fn record_event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failing handler
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a host request answered by this panel
    pub fn record_request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped inbound message
    pub fn record_drop(&self, reason: DropReason) {
        *self.dropped.lock().entry(reason).or_insert(0) += 1;
    }

    /// Record the arrival of a trusted message
    pub fn record_inbound(&self) {
        *self.last_message_at.lock() = Some(Utc::now());
    }

    /// Requests sent
    pub fn calls_sent(&self) -> u64 {
        self.calls_sent.load(Ordering::Relaxed)
    }

    /// Calls resolved
    pub fn calls_resolved(&self) -> u64 {
        self.calls_resolved.load(Ordering::Relaxed)
    }

    /// Calls rejected by the host
    pub fn calls_rejected(&self) -> u64 {
        self.calls_rejected.load(Ordering::Relaxed)
    }

    /// Calls timed out
    pub fn calls_timed_out(&self) -> u64 {
        self.calls_timed_out.load(Ordering::Relaxed)
    }

    /// Events emitted
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    /// Events dispatched
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    /// Handler failures
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Requests served
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    /// Drop count for one reason
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped.lock().get(&reason).copied().unwrap_or(0)
    }

    /// Average round-trip time of resolved calls in microseconds
    pub fn avg_call_time_us(&self) -> f64 {
        let total = self.calls_resolved.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.total_call_time_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Build a statistics snapshot
    pub fn snapshot(&self, state: String, pending_calls: usize, subscriptions: usize) -> BridgeStats {
        BridgeStats {
            state,
            pending_calls,
            subscriptions,
            calls_sent: self.calls_sent(),
            calls_resolved: self.calls_resolved(),
            calls_rejected: self.calls_rejected(),
            calls_timed_out: self.calls_timed_out(),
            avg_call_time_us: self.avg_call_time_us(),
            events_emitted: self.events_emitted(),
            events_dispatched: self.events_dispatched(),
            handler_failures: self.handler_failures(),
            requests_served: self.requests_served(),
            dropped: self
                .dropped
                .lock()
                .iter()
                .map(|(reason, count)| (reason.as_str().to_string(), *count))
                .collect(),
            last_message_at: *self.last_message_at.lock(),
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP nexus_bridge_calls_total Calls to the host by outcome\n");
        output.push_str("# TYPE nexus_bridge_calls_total counter\n");
        output.push_str(&format!(
            "nexus_bridge_calls_total{{status=\"sent\"}} {}\n",
            self.calls_sent()
        ));
        output.push_str(&format!(
            "nexus_bridge_calls_total{{status=\"resolved\"}} {}\n",
            self.calls_resolved()
        ));
        output.push_str(&format!(
            "nexus_bridge_calls_total{{status=\"rejected\"}} {}\n",
            self.calls_rejected()
        ));
        output.push_str(&format!(
            "nexus_bridge_calls_total{{status=\"timeout\"}} {}\n",
            self.calls_timed_out()
        ));

        output.push_str("\n# HELP nexus_bridge_call_time_us Average call round-trip time\n");
        output.push_str("# TYPE nexus_bridge_call_time_us gauge\n");
        output.push_str(&format!(
            "nexus_bridge_call_time_us {:.2}\n",
            self.avg_call_time_us()
        ));

        output.push_str("\n# HELP nexus_bridge_events_total Events by direction\n");
        output.push_str("# TYPE nexus_bridge_events_total counter\n");
        output.push_str(&format!(
            "nexus_bridge_events_total{{direction=\"outbound\"}} {}\n",
            self.events_emitted()
        ));
        output.push_str(&format!(
            "nexus_bridge_events_total{{direction=\"inbound\"}} {}\n",
            self.events_dispatched()
        ));

        output.push_str("\n# HELP nexus_bridge_handler_failures_total Failing handlers\n");
        output.push_str("# TYPE nexus_bridge_handler_failures_total counter\n");
        output.push_str(&format!(
            "nexus_bridge_handler_failures_total {}\n",
            self.handler_failures()
        ));

        output.push_str("\n# HELP nexus_bridge_requests_served_total Host requests answered\n");
        output.push_str("# TYPE nexus_bridge_requests_served_total counter\n");
        output.push_str(&format!(
            "nexus_bridge_requests_served_total {}\n",
            self.requests_served()
        ));

        output.push_str("\n# HELP nexus_bridge_dropped_total Dropped inbound messages\n");
        output.push_str("# TYPE nexus_bridge_dropped_total counter\n");
        for (reason, count) in self.dropped.lock().iter() {
            output.push_str(&format!(
                "nexus_bridge_dropped_total{{reason=\"{}\"}} {}\n",
                reason.as_str(),
                count
            ));
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_counters() {
        let collector = MetricsCollector::new();
        collector.record_call_sent();
        collector.record_call_sent();
        collector.record_call_resolved(Duration::from_millis(10));
        collector.record_call_timed_out();

        assert_eq!(collector.calls_sent(), 2);
        assert_eq!(collector.calls_resolved(), 1);
        assert_eq!(collector.calls_timed_out(), 1);
        assert_eq!(collector.calls_rejected(), 0);
    }

    #[test]
    fn test_avg_call_time() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.avg_call_time_us(), 0.0);

        collector.record_call_resolved(Duration::from_millis(10));
        collector.record_call_resolved(Duration::from_millis(30));
        assert!((collector.avg_call_time_us() - 20_000.0).abs() < 0.01);
    }

    #[test]
    fn test_drop_counts() {
        let collector = MetricsCollector::new();
        collector.record_drop(DropReason::UntrustedOrigin);
        collector.record_drop(DropReason::UntrustedOrigin);
        collector.record_drop(DropReason::LateResponse);

        assert_eq!(collector.dropped(DropReason::UntrustedOrigin), 2);
        assert_eq!(collector.dropped(DropReason::LateResponse), 1);
        assert_eq!(collector.dropped(DropReason::DecodeError), 0);
    }

    #[test]
    fn test_snapshot() {
        let collector = MetricsCollector::new();
        collector.record_event_emitted();
        collector.record_drop(DropReason::DecodeError);
        collector.record_inbound();

        let stats = collector.snapshot("ready".into(), 3, 2);
        assert_eq!(stats.state, "ready");
        assert_eq!(stats.pending_calls, 3);
        assert_eq!(stats.subscriptions, 2);
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(stats.dropped.get("decode_error"), Some(&1));
        assert!(stats.last_message_at.is_some());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["pendingCalls"], 3);
    }

    #[test]
    fn test_prometheus_output() {
        let collector = MetricsCollector::new();
        collector.record_call_sent();
        collector.record_drop(DropReason::UntrustedOrigin);

        let output = collector.to_prometheus();
        assert!(output.contains("nexus_bridge_calls_total{status=\"sent\"} 1"));
        assert!(output.contains("nexus_bridge_dropped_total{reason=\"untrusted_origin\"} 1"));
    }
}
