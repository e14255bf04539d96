//! The frame driver.
//!
//! `FrameDriver` is the bridge's public facade. It owns the transport
//! adapter, the pending-call registry, the event bus and the host context,
//! and routes every inbound envelope to the right one of them.
//!
//! Lifecycle: `Uninitialized → Handshaking → Ready → Closed`. A failed
//! handshake returns to `Uninitialized` so the bootstrap can retry.
//!
//! Policy before `Ready`: `on()` and `serve()` always work, inbound events
//! are queued and delivered in arrival order once the handshake completes,
//! and `call()`/`emit()` fail fast with `NotReady`.

use crate::config::BridgeConfig;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::events::{EventBus, Subscription};
use crate::host::{ContextStore, HostContext, HostProxy};
use crate::metrics::{BridgeStats, DropReason, MetricsCollector};
use crate::registry::{PendingCallRegistry, PendingHandle};
use crate::transport::{RawMessage, Transport, TransportAdapter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Future returned by bridge operations that wait on the host
pub type BridgeFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Handler answering a host request
pub type RequestHandler = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Bridge lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    /// `initialize()` has not been called, or the last handshake failed
    Uninitialized,
    /// Waiting for the host to answer the ready event
    Handshaking,
    /// Handshake complete; calls and events flow
    Ready,
    /// Torn down; nothing flows any more
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Uninitialized => write!(f, "uninitialized"),
            BridgeState::Handshaking => write!(f, "handshaking"),
            BridgeState::Ready => write!(f, "ready"),
            BridgeState::Closed => write!(f, "closed"),
        }
    }
}

struct Lifecycle {
    state: BridgeState,
    handshake_id: Option<String>,
    queued_events: VecDeque<Envelope>,
}

struct DriverInner {
    config: BridgeConfig,
    transport: TransportAdapter,
    lifecycle: Mutex<Lifecycle>,
    registry: Mutex<PendingCallRegistry>,
    events: EventBus,
    services: Mutex<HashMap<String, RequestHandler>>,
    context: ContextStore,
    metrics: Arc<MetricsCollector>,
}

/// Bridge between an embedded panel and its parent frame
#[derive(Clone)]
pub struct FrameDriver {
    inner: Arc<DriverInner>,
}

enum HandshakeStart {
    AlreadyReady,
    Started(PendingHandle),
}

impl FrameDriver {
    /// Create a driver over a transport
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new());
        let adapter = TransportAdapter::new(transport, &config, Arc::clone(&metrics))?;

        info!(
            panel_id = %config.panel_id,
            target_origin = %config.target_origin,
            allowed_origins = config.allowed_origins.len(),
            "Creating frame driver"
        );

        Ok(Self {
            inner: Arc::new(DriverInner {
                config,
                transport: adapter,
                lifecycle: Mutex::new(Lifecycle {
                    state: BridgeState::Uninitialized,
                    handshake_id: None,
                    queued_events: VecDeque::new(),
                }),
                registry: Mutex::new(PendingCallRegistry::new()),
                events: EventBus::new(),
                services: Mutex::new(HashMap::new()),
                context: ContextStore::new(),
                metrics,
            }),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> BridgeState {
        self.inner.lifecycle.lock().state
    }

    /// The configuration this driver runs with
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Typed proxy for application code
    pub fn host(&self) -> HostProxy {
        HostProxy::new(self.clone())
    }

    pub(crate) fn context_store(&self) -> &ContextStore {
        &self.inner.context
    }

    /// Perform the handshake with the host
    ///
    /// The ready event is posted before this returns; the future completes
    /// once the host's response has populated the host context, or fails with
    /// `HandshakeTimeout` when no response arrives in time.
    pub fn initialize(&self) -> BridgeFuture<()> {
        let span = info_span!("initialize", panel_id = %self.inner.config.panel_id);
        let started = span.in_scope(|| self.inner.begin_handshake());
        let inner = Arc::clone(&self.inner);
        Box::pin(
            async move {
                match started? {
                    HandshakeStart::AlreadyReady => Ok(()),
                    HandshakeStart::Started(handle) => inner.await_handshake(handle).await,
                }
            }
            .instrument(span),
        )
    }

    /// Call a host method with the configured timeout
    pub fn call(&self, method: &str, args: Value) -> BridgeFuture<Value> {
        let timeout = Duration::from_millis(self.inner.config.call_timeout_ms);
        self.call_with_timeout(method, args, timeout)
    }

    /// Call a host method with an explicit timeout
    ///
    /// The request is posted before this returns. Concurrent calls are
    /// independent and may complete in any order.
    pub fn call_with_timeout(&self, method: &str, args: Value, timeout: Duration) -> BridgeFuture<Value> {
        let span = info_span!("call", method = %method, timeout_ms = timeout.as_millis() as u64);
        let started = span.in_scope(|| self.inner.start_call(method, args, timeout));
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.await_call(started?).await }.instrument(span))
    }

    /// Subscribe to an inbound event
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        debug!(event = %event, "Subscribing to host event");
        self.inner.events.subscribe(event, handler)
    }

    /// Send a fire-and-forget event to the host
    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner.transport.send(&Envelope::event(event, payload))?;
        self.inner.metrics.record_event_emitted();
        debug!(event = %event, "Emitted event");
        Ok(())
    }

    /// Answer host requests for `method`
    ///
    /// Replaces any handler previously registered for the same method.
    pub fn serve<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let previous = self
            .inner
            .services
            .lock()
            .insert(method.to_string(), Arc::new(handler));
        if previous.is_some() {
            debug!(method = %method, "Replaced request handler");
        }
    }

    /// Stop answering host requests for `method`
    pub fn unserve(&self, method: &str) -> bool {
        self.inner.services.lock().remove(method).is_some()
    }

    /// Feed one inbound message from the host window
    pub fn receive(&self, raw: RawMessage) {
        self.inner.receive(raw);
    }

    /// Process inbound messages in arrival order until the channel ends
    ///
    /// The bridge is closed when the channel ends (page unload).
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<RawMessage>) {
        while let Some(raw) = inbound.recv().await {
            self.inner.receive(raw);
            if self.state() == BridgeState::Closed {
                break;
            }
        }
        self.close();
    }

    /// Run the inbound pump on the tokio runtime
    pub fn spawn(&self, inbound: mpsc::UnboundedReceiver<RawMessage>) -> JoinHandle<()> {
        let driver = self.clone();
        tokio::spawn(async move { driver.run(inbound).await })
    }

    /// Close the bridge, failing every pending call with `Closed`
    #[instrument(skip(self))]
    pub fn close(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state == BridgeState::Closed {
                return;
            }
            lifecycle.state = BridgeState::Closed;
            lifecycle.handshake_id = None;
            lifecycle.queued_events.clear();
        }

        let rejected = self
            .inner
            .registry
            .lock()
            .reject_all(|_, _| BridgeError::Closed);
        info!(rejected_calls = rejected, "Frame driver closed");
    }

    /// Number of calls awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> BridgeStats {
        self.inner.metrics.snapshot(
            self.state().to_string(),
            self.pending_calls(),
            self.inner.events.len(),
        )
    }

    /// Prometheus-format metrics
    pub fn prometheus_metrics(&self) -> String {
        self.inner.metrics.to_prometheus()
    }
}

impl DriverInner {
    fn ensure_ready(&self) -> Result<()> {
        match self.lifecycle.lock().state {
            BridgeState::Ready => Ok(()),
            BridgeState::Closed => Err(BridgeError::Closed),
            other => Err(BridgeError::NotReady(other)),
        }
    }

    fn begin_handshake(&self) -> Result<HandshakeStart> {
        // An abandoned initialize() future leaves an expired handshake behind
        self.sweep_expired();

        let id = Uuid::new_v4().to_string();
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                BridgeState::Ready => return Ok(HandshakeStart::AlreadyReady),
                BridgeState::Closed => return Err(BridgeError::Closed),
                BridgeState::Handshaking => {
                    return Err(BridgeError::InvalidState(
                        "handshake already in progress".into(),
                    ))
                }
                BridgeState::Uninitialized => {}
            }

            let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
            let handle = self
                .registry
                .lock()
                .register(id.clone(), self.config.init_response.clone(), timeout)?;
            lifecycle.state = BridgeState::Handshaking;
            lifecycle.handshake_id = Some(id.clone());
            handle
        };

        let ready = Envelope::event(
            self.config.ready_event.clone(),
            json!({ "panelId": self.config.panel_id, "version": crate::VERSION }),
        )
        .with_id(id.clone());

        if let Err(err) = self.transport.send(&ready) {
            self.registry.lock().take(&id);
            self.abort_handshake(&id);
            return Err(err);
        }

        info!(
            handshake_id = %id,
            timeout_ms = self.config.handshake_timeout_ms,
            "Sent ready event, awaiting host"
        );
        Ok(HandshakeStart::Started(handle))
    }

    async fn await_handshake(&self, mut handle: PendingHandle) -> Result<()> {
        let id = handle.id().to_string();
        let outcome = match timeout_at(handle.deadline(), &mut handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let expired = self.registry.lock().expire(&id);
                match expired {
                    Some(err) => Err(err),
                    None => handle.await,
                }
            }
        };

        match outcome {
            Ok(_) => Ok(()),
            Err(err) => {
                self.abort_handshake(&id);
                if err.is_timeout() {
                    warn!(
                        timeout_ms = self.config.handshake_timeout_ms,
                        "Host did not answer the handshake"
                    );
                    Err(BridgeError::HandshakeTimeout(self.config.handshake_timeout_ms))
                } else {
                    warn!(error = %err, "Handshake failed");
                    Err(err)
                }
            }
        }
    }

    /// Return to `Uninitialized` if `id` is still the handshake in progress
    fn abort_handshake(&self, id: &str) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == BridgeState::Handshaking
            && lifecycle.handshake_id.as_deref() == Some(id)
        {
            lifecycle.state = BridgeState::Uninitialized;
            lifecycle.handshake_id = None;
            lifecycle.queued_events.clear();
        }
    }

    fn start_call(&self, method: &str, args: Value, timeout: Duration) -> Result<PendingHandle> {
        self.ensure_ready()?;
        self.sweep_expired();

        let id = Uuid::new_v4().to_string();
        let handle = self.registry.lock().register(id.clone(), method, timeout)?;

        if let Err(err) = self.transport.send(&Envelope::request(id.clone(), method, args)) {
            self.registry.lock().take(&id);
            return Err(err);
        }

        self.metrics.record_call_sent();
        debug!(id = %id, method = %method, "Sent request");
        Ok(handle)
    }

    async fn await_call(&self, mut handle: PendingHandle) -> Result<Value> {
        match timeout_at(handle.deadline(), &mut handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let expired = self.registry.lock().expire(handle.id());
                match expired {
                    Some(err) => {
                        self.metrics.record_call_timed_out();
                        warn!(id = %handle.id(), "Call timed out");
                        Err(err)
                    }
                    // Settled in the same instant the timer fired
                    None => handle.await,
                }
            }
        }
    }

    /// Reject calls whose deadline has passed
    fn sweep_expired(&self) {
        let expired = self.registry.lock().sweep_expired(Instant::now());
        if expired.is_empty() {
            return;
        }

        let handshake_id = self.lifecycle.lock().handshake_id.clone();
        for id in &expired {
            if handshake_id.as_deref() == Some(id.as_str()) {
                self.abort_handshake(id);
            } else {
                self.metrics.record_call_timed_out();
            }
        }
    }

    fn receive(&self, raw: RawMessage) {
        if self.lifecycle.lock().state == BridgeState::Closed {
            self.metrics.record_drop(DropReason::Closed);
            self.transport
                .log_dropped(DropReason::Closed, &raw.origin, "bridge is closed");
            return;
        }

        let Some(envelope) = self.transport.receive(&raw) else {
            return;
        };
        self.sweep_expired();

        match envelope.kind {
            EnvelopeKind::Response => self.route_response(envelope, &raw.origin),
            EnvelopeKind::Event => self.route_event(envelope),
            EnvelopeKind::Request => self.route_request(envelope),
        }
    }

    fn route_response(&self, envelope: Envelope, origin: &str) {
        // Validated envelopes always carry an id on responses
        let id = envelope.id.clone().unwrap_or_default();

        let handshake_id = {
            let lifecycle = self.lifecycle.lock();
            match (&lifecycle.state, &lifecycle.handshake_id) {
                (BridgeState::Handshaking, Some(hs_id))
                    if *hs_id == id
                        || envelope.name == self.config.init_response
                        || envelope.name == self.config.ack_response =>
                {
                    Some(hs_id.clone())
                }
                _ => None,
            }
        };

        if let Some(hs_id) = handshake_id {
            self.complete_handshake(&hs_id, envelope, origin);
            return;
        }

        let settled = {
            let mut registry = self.registry.lock();
            match envelope.error {
                Some(message) => {
                    let method = registry
                        .method_of(&id)
                        .unwrap_or(envelope.name.as_str())
                        .to_string();
                    let rejected = registry.reject(&id, BridgeError::Remote { method, message });
                    if rejected {
                        self.metrics.record_call_rejected();
                    }
                    rejected
                }
                None => match registry.resolve(&id, envelope.payload) {
                    Some(elapsed) => {
                        self.metrics.record_call_resolved(elapsed);
                        true
                    }
                    None => false,
                },
            }
        };

        if settled {
            debug!(id = %id, "Response delivered");
        } else {
            self.metrics.record_drop(DropReason::LateResponse);
            self.transport.log_dropped(
                DropReason::LateResponse,
                origin,
                &format!("no pending call for id '{}'", id),
            );
        }
    }

    fn complete_handshake(&self, hs_id: &str, envelope: Envelope, origin: &str) {
        if let Some(message) = envelope.error {
            let method = self.config.init_response.clone();
            self.registry
                .lock()
                .reject(hs_id, BridgeError::Remote { method, message });
            self.abort_handshake(hs_id);
            return;
        }

        let context = match HostContext::from_payload(&envelope.payload) {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "Ignoring unusable handshake context");
                HostContext::default()
            }
        };

        // Ready must be visible before the initialize() future wakes up
        let queued = {
            let mut lifecycle = self.lifecycle.lock();
            let mut registry = self.registry.lock();
            if !registry.contains(hs_id) {
                None
            } else {
                self.context.replace(context);
                lifecycle.state = BridgeState::Ready;
                lifecycle.handshake_id = None;
                registry.resolve(hs_id, envelope.payload);
                Some(std::mem::take(&mut lifecycle.queued_events))
            }
        };

        let Some(queued) = queued else {
            self.metrics.record_drop(DropReason::LateResponse);
            self.transport
                .log_dropped(DropReason::LateResponse, origin, "handshake already expired");
            return;
        };

        info!(queued_events = queued.len(), "Handshake complete, bridge ready");
        for event in queued {
            self.dispatch_event(event);
        }
    }

    fn route_event(&self, envelope: Envelope) {
        let overflow = {
            let mut lifecycle = self.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                BridgeState::Ready => false,
                BridgeState::Closed => return,
                BridgeState::Uninitialized | BridgeState::Handshaking => {
                    if lifecycle.queued_events.len() < self.config.max_queued_events {
                        debug!(event = %envelope.name, "Queued event until handshake completes");
                        lifecycle.queued_events.push_back(envelope);
                        return;
                    }
                    true
                }
            }
        };

        if overflow {
            self.metrics.record_drop(DropReason::QueueOverflow);
            warn!(event = %envelope.name, "Pre-handshake event queue full, dropping event");
            return;
        }
        self.dispatch_event(envelope);
    }

    fn dispatch_event(&self, envelope: Envelope) {
        if envelope.name == self.config.context_changed_event {
            match HostContext::from_payload(&envelope.payload) {
                Ok(context) => {
                    self.context.replace(context);
                    debug!("Host context replaced");
                }
                Err(err) => warn!(error = %err, "Ignoring unusable context update"),
            }
        }

        let report = self.events.dispatch(&envelope.name, &envelope.payload);
        self.metrics.record_event_dispatched();
        for _ in 0..report.failed {
            self.metrics.record_handler_failure();
        }
    }

    fn route_request(&self, envelope: Envelope) {
        let id = envelope.id.clone().unwrap_or_default();
        let handler = self.services.lock().get(&envelope.name).cloned();

        let response = match handler {
            None => {
                debug!(method = %envelope.name, "No handler for host request");
                Envelope::error_response(
                    id,
                    envelope.name.clone(),
                    format!(
                        "[{}] Method '{}' is not served by this panel",
                        ErrorCode::MethodNotFound,
                        envelope.name
                    ),
                )
            }
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&envelope.payload))) {
                Ok(Ok(result)) => {
                    self.metrics.record_request_served();
                    Envelope::response(id, envelope.name.clone(), result)
                }
                Ok(Err(err)) => {
                    self.metrics.record_handler_failure();
                    warn!(method = %envelope.name, "Request handler failed: {:#}", err);
                    Envelope::error_response(
                        id,
                        envelope.name.clone(),
                        format!("[{}] {:#}", ErrorCode::HandlerError, err),
                    )
                }
                Err(_) => {
                    self.metrics.record_handler_failure();
                    warn!(method = %envelope.name, "Request handler panicked");
                    Envelope::error_response(
                        id,
                        envelope.name.clone(),
                        format!("[{}] handler panicked", ErrorCode::HandlerError),
                    )
                }
            },
        };

        if let Err(err) = self.transport.send(&response) {
            warn!(method = %envelope.name, error = %err, "Failed to answer host request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, OutboundMessage};
    use serde_json::json;

    const HOST: &str = "https://console.dataloop.ai";

    fn create_driver() -> (FrameDriver, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (transport, rx) = ChannelTransport::new();
        let config = BridgeConfig::for_origin(HOST).with_handshake_timeout(5000);
        (FrameDriver::new(config, Arc::new(transport)).unwrap(), rx)
    }

    fn host_send(driver: &FrameDriver, envelope: &Envelope) {
        driver.receive(RawMessage::from_envelope(HOST, envelope).unwrap());
    }

    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Envelope {
        rx.try_recv().expect("outbound message").envelope().unwrap()
    }

    async fn ready_driver() -> (FrameDriver, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (driver, mut rx) = create_driver();
        let init = driver.initialize();
        let ready = next_envelope(&mut rx);
        host_send(
            &driver,
            &Envelope::response(ready.id.unwrap(), "init", json!({"currentItem": "abc"})),
        );
        init.await.unwrap();
        (driver, rx)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BridgeState::Handshaking.to_string(), "handshaking");
        assert_eq!(serde_json::to_value(BridgeState::Ready).unwrap(), json!("ready"));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let (transport, _rx) = ChannelTransport::new();
        let result = FrameDriver::new(BridgeConfig::default(), Arc::new(transport));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_sends_ready_event() {
        let (driver, mut rx) = create_driver();
        let _init = driver.initialize();

        assert_eq!(driver.state(), BridgeState::Handshaking);
        let ready = next_envelope(&mut rx);
        assert_eq!(ready.kind, EnvelopeKind::Event);
        assert_eq!(ready.name, "ready");
        assert!(ready.id.is_some());
        assert_eq!(ready.payload["panelId"], json!("panel"));
    }

    #[tokio::test]
    async fn test_initialize_populates_context() {
        let (driver, _rx) = ready_driver().await;
        assert_eq!(driver.state(), BridgeState::Ready);
        assert_eq!(driver.host().current_item(), Some(json!("abc")));
    }

    #[tokio::test]
    async fn test_handshake_by_name_without_matching_id() {
        let (driver, mut rx) = create_driver();
        let init = driver.initialize();
        let _ready = next_envelope(&mut rx);

        host_send(&driver, &Envelope::response("host-chosen", "ack", Value::Null));
        init.await.unwrap();
        assert_eq!(driver.state(), BridgeState::Ready);
        assert!(driver.host().current_item().is_none());
    }

    #[tokio::test]
    async fn test_initialize_twice() {
        let (driver, mut rx) = create_driver();
        let first = driver.initialize();
        assert!(matches!(
            driver.initialize().await,
            Err(BridgeError::InvalidState(_))
        ));

        let ready = next_envelope(&mut rx);
        host_send(&driver, &Envelope::response(ready.id.unwrap(), "init", json!({})));
        first.await.unwrap();

        // Already ready: resolves without another ready event
        driver.initialize().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_error_response() {
        let (driver, mut rx) = create_driver();
        let init = driver.initialize();
        let ready = next_envelope(&mut rx);

        host_send(
            &driver,
            &Envelope::error_response(ready.id.unwrap(), "init", "panel not installed"),
        );
        match init.await {
            Err(BridgeError::Remote { message, .. }) => assert_eq!(message, "panel not installed"),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert_eq!(driver.state(), BridgeState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_allows_retry() {
        let (driver, mut rx) = create_driver();
        let result = driver.initialize().await;
        assert!(matches!(result, Err(BridgeError::HandshakeTimeout(5000))));
        assert_eq!(driver.state(), BridgeState::Uninitialized);
        assert_eq!(driver.pending_calls(), 0);

        let _stale = next_envelope(&mut rx);
        let retry = driver.initialize();
        let ready = next_envelope(&mut rx);
        host_send(&driver, &Envelope::response(ready.id.unwrap(), "init", json!({})));
        retry.await.unwrap();
        assert_eq!(driver.state(), BridgeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_handshake_allows_retry() {
        let (driver, mut rx) = create_driver();
        drop(driver.initialize());
        let _abandoned = next_envelope(&mut rx);
        assert_eq!(driver.state(), BridgeState::Handshaking);

        tokio::time::advance(Duration::from_secs(60)).await;

        let retry = driver.initialize();
        let ready = next_envelope(&mut rx);
        host_send(&driver, &Envelope::response(ready.id.unwrap(), "init", json!({})));
        retry.await.unwrap();
        assert_eq!(driver.state(), BridgeState::Ready);
        assert_eq!(driver.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_futures_run_on_spawned_tasks() {
        let (driver, mut rx) = create_driver();
        let init = tokio::spawn(driver.initialize());
        let ready = next_envelope(&mut rx);
        host_send(&driver, &Envelope::response(ready.id.unwrap(), "init", json!({})));
        init.await.unwrap().unwrap();

        let method = String::from("getItem");
        let call = tokio::spawn(driver.call(&method, Value::Null));
        drop(method);
        let request = next_envelope(&mut rx);
        host_send(&driver, &Envelope::response(request.id.unwrap(), "getItem", json!(7)));
        assert_eq!(call.await.unwrap().unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_call_with_unbounded_timeout() {
        let (driver, mut rx) = ready_driver().await;
        let pending = driver.call_with_timeout("watch", Value::Null, Duration::MAX);
        let request = next_envelope(&mut rx);
        assert_eq!(driver.pending_calls(), 1);

        host_send(&driver, &Envelope::response(request.id.unwrap(), "watch", json!("done")));
        assert_eq!(pending.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_call_and_emit_fail_fast_before_ready() {
        let (driver, mut rx) = create_driver();
        assert!(matches!(
            driver.call("getItem", json!({})).await,
            Err(BridgeError::NotReady(BridgeState::Uninitialized))
        ));
        assert!(matches!(
            driver.emit("status", json!({})),
            Err(BridgeError::NotReady(BridgeState::Uninitialized))
        ));

        let _init = driver.initialize();
        assert!(matches!(
            driver.emit("status", json!({})),
            Err(BridgeError::NotReady(BridgeState::Handshaking))
        ));
        // Only the ready event went out
        let _ready = next_envelope(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (driver, mut rx) = ready_driver().await;
        let pending = driver.call("getItem", json!({"id": "abc"}));

        let request = next_envelope(&mut rx);
        assert_eq!(request.kind, EnvelopeKind::Request);
        assert_eq!(request.name, "getItem");
        assert_eq!(request.payload, json!({"id": "abc"}));

        host_send(
            &driver,
            &Envelope::response(request.id.unwrap(), "getItem", json!({"name": "frame.png"})),
        );
        assert_eq!(pending.await.unwrap(), json!({"name": "frame.png"}));
        assert_eq!(driver.pending_calls(), 0);
        assert_eq!(driver.stats().calls_resolved, 1);
    }

    #[tokio::test]
    async fn test_call_remote_error() {
        let (driver, mut rx) = ready_driver().await;
        let pending = driver.call("deleteItem", json!({"id": "abc"}));
        let request = next_envelope(&mut rx);

        host_send(
            &driver,
            &Envelope::error_response(request.id.unwrap(), "deleteItem", "forbidden"),
        );
        match pending.await {
            Err(BridgeError::Remote { method, message }) => {
                assert_eq!(method, "deleteItem");
                assert_eq!(message, "forbidden");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let (driver, mut rx) = ready_driver().await;
        let mut a = driver.call("first", json!(1));
        let b = driver.call("second", json!(2));
        let id_a = next_envelope(&mut rx).id.unwrap();
        let id_b = next_envelope(&mut rx).id.unwrap();
        assert_ne!(id_a, id_b);

        host_send(&driver, &Envelope::response(id_b, "second", json!("B")));
        assert_eq!(b.await.unwrap(), json!("B"));
        assert_eq!(driver.pending_calls(), 1);
        assert!(still_pending(&mut a).await);

        host_send(&driver, &Envelope::response(id_a, "first", json!("A")));
        assert_eq!(a.await.unwrap(), json!("A"));
    }

    async fn still_pending(fut: &mut BridgeFuture<Value>) -> bool {
        tokio::time::timeout(Duration::from_millis(10), fut).await.is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_then_late_response() {
        let (driver, mut rx) = ready_driver().await;
        let pending = driver.call_with_timeout("slow", Value::Null, Duration::from_millis(200));
        let id = next_envelope(&mut rx).id.unwrap();

        match pending.await {
            Err(BridgeError::Timeout { method, timeout_ms, .. }) => {
                assert_eq!(method, "slow");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(driver.pending_calls(), 0);

        host_send(&driver, &Envelope::response(id, "slow", json!("late")));
        let stats = driver.stats();
        assert_eq!(stats.calls_timed_out, 1);
        assert_eq!(stats.calls_resolved, 0);
        assert_eq!(stats.dropped.get("late_response"), Some(&1));
    }

    #[tokio::test]
    async fn test_untrusted_origin_is_ignored() {
        let (driver, mut rx) = ready_driver().await;
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        driver.on("selection", move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        let mut pending = driver.call("getItem", Value::Null);
        let id = next_envelope(&mut rx).id.unwrap();

        let evil = "https://evil.example";
        driver.receive(
            RawMessage::from_envelope(evil, &Envelope::event("selection", json!([1]))).unwrap(),
        );
        driver.receive(
            RawMessage::from_envelope(evil, &Envelope::response(id.clone(), "getItem", json!("x")))
                .unwrap(),
        );

        assert_eq!(*hits.lock(), 0);
        assert!(still_pending(&mut pending).await);
        assert_eq!(driver.pending_calls(), 1);
        assert_eq!(driver.stats().dropped.get("untrusted_origin"), Some(&2));

        host_send(&driver, &Envelope::response(id, "getItem", json!("real")));
        assert_eq!(pending.await.unwrap(), json!("real"));
    }

    #[tokio::test]
    async fn test_handlers_invoked_in_registration_order() {
        let (driver, _rx) = ready_driver().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        driver.on("selection", move |p| {
            l1.lock().push(("h1", p.clone()));
            Ok(())
        });
        let l2 = Arc::clone(&log);
        driver.on("selection", move |p| {
            l2.lock().push(("h2", p.clone()));
            Ok(())
        });

        host_send(&driver, &Envelope::event("selection", json!(["item-1"])));
        assert_eq!(
            *log.lock(),
            vec![("h1", json!(["item-1"])), ("h2", json!(["item-1"]))]
        );
    }

    #[tokio::test]
    async fn test_emit_when_ready() {
        let (driver, mut rx) = ready_driver().await;
        driver.emit("annotation-created", json!({"id": 7})).unwrap();

        let event = next_envelope(&mut rx);
        assert_eq!(event.kind, EnvelopeKind::Event);
        assert_eq!(event.name, "annotation-created");
        assert!(event.id.is_none());
        assert_eq!(driver.stats().events_emitted, 1);
    }

    #[tokio::test]
    async fn test_events_queued_until_ready() {
        let (driver, mut rx) = create_driver();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        driver.on("viewport", move |p| {
            log.lock().push(p.clone());
            Ok(())
        });

        let init = driver.initialize();
        let ready = next_envelope(&mut rx);
        host_send(&driver, &Envelope::event("viewport", json!(1)));
        host_send(&driver, &Envelope::event("viewport", json!(2)));
        assert!(seen.lock().is_empty());

        host_send(&driver, &Envelope::response(ready.id.unwrap(), "init", json!({})));
        init.await.unwrap();
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_event_queue_is_bounded() {
        let (transport, mut rx) = ChannelTransport::new();
        let config = BridgeConfig::for_origin(HOST).with_max_queued_events(1);
        let driver = FrameDriver::new(config, Arc::new(transport)).unwrap();
        let _init = driver.initialize();
        let _ready = next_envelope(&mut rx);

        host_send(&driver, &Envelope::event("viewport", json!(1)));
        host_send(&driver, &Envelope::event("viewport", json!(2)));
        assert_eq!(driver.stats().dropped.get("queue_overflow"), Some(&1));
    }

    #[tokio::test]
    async fn test_context_changed_replaces_snapshot() {
        let (driver, _rx) = ready_driver().await;
        let host = driver.host();
        let before = host.context();

        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let inner_host = host.clone();
        driver.on("context-changed", move |_| {
            *slot.lock() = inner_host.current_item();
            Ok(())
        });

        host_send(
            &driver,
            &Envelope::event("context-changed", json!({"currentItem": "def", "user": "u1"})),
        );

        assert_eq!(before.current_item, Some(json!("abc")));
        assert_eq!(host.current_item(), Some(json!("def")));
        assert_eq!(host.user(), Some(json!("u1")));
        // Handlers already see the new snapshot
        assert_eq!(*observed.lock(), Some(json!("def")));
    }

    #[tokio::test]
    async fn test_serve_answers_host_request() {
        let (driver, mut rx) = ready_driver().await;
        driver.serve("getSelection", |args| Ok(json!({"echo": args.clone()})));

        host_send(&driver, &Envelope::request("h-1", "getSelection", json!([1, 2])));
        let response = next_envelope(&mut rx);
        assert_eq!(response.kind, EnvelopeKind::Response);
        assert_eq!(response.id.as_deref(), Some("h-1"));
        assert_eq!(response.payload, json!({"echo": [1, 2]}));
        assert_eq!(driver.stats().requests_served, 1);
    }

    #[tokio::test]
    async fn test_serve_unknown_and_failing_methods() {
        let (driver, mut rx) = ready_driver().await;
        driver.serve("explode", |_| anyhow::bail!("renderer unavailable"));

        host_send(&driver, &Envelope::request("h-1", "missing", Value::Null));
        let response = next_envelope(&mut rx);
        assert!(response.error.unwrap().starts_with("[METHOD_NOT_FOUND]"));

        host_send(&driver, &Envelope::request("h-2", "explode", Value::Null));
        let response = next_envelope(&mut rx);
        let error = response.error.unwrap();
        assert!(error.starts_with("[HANDLER_ERROR]"));
        assert!(error.contains("renderer unavailable"));

        assert!(driver.unserve("explode"));
        assert!(!driver.unserve("explode"));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_calls() {
        let (driver, mut rx) = ready_driver().await;
        let pending = driver.call("getItem", Value::Null);
        let _request = next_envelope(&mut rx);

        driver.close();
        assert_eq!(driver.state(), BridgeState::Closed);
        assert!(matches!(pending.await, Err(BridgeError::Closed)));
        assert!(matches!(driver.emit("x", Value::Null), Err(BridgeError::Closed)));
        assert!(matches!(driver.initialize().await, Err(BridgeError::Closed)));

        host_send(&driver, &Envelope::event("selection", Value::Null));
        assert_eq!(driver.stats().dropped.get("closed"), Some(&1));
    }

    #[tokio::test]
    async fn test_run_processes_channel_then_closes() {
        let (driver, mut rx) = create_driver();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pump = driver.spawn(inbound_rx);

        let init = driver.initialize();
        let ready = next_envelope(&mut rx);
        inbound_tx
            .send(
                RawMessage::from_envelope(
                    HOST,
                    &Envelope::response(ready.id.unwrap(), "init", json!({"currentItem": "x"})),
                )
                .unwrap(),
            )
            .unwrap();
        init.await.unwrap();
        assert_eq!(driver.host().current_item(), Some(json!("x")));

        drop(inbound_tx);
        pump.await.unwrap();
        assert_eq!(driver.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_prometheus_metrics() {
        let (driver, _rx) = ready_driver().await;
        let output = driver.prometheus_metrics();
        assert!(output.contains("nexus_bridge_calls_total"));
    }
}
