//! Pending-call registry.
//!
//! Tracks requests sent to the host that are still waiting for their
//! response, keyed by correlation id. Each entry leaves the registry exactly
//! once: resolved, rejected, timed out, or taken back by its caller.

use crate::error::{BridgeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Outcome delivered to a waiting caller
pub type CallOutcome = Result<Value>;

/// Deadline offset used when a timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// An outstanding request
#[derive(Debug)]
struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallOutcome>,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
}

/// Future completing when the matching response arrives
#[derive(Debug)]
pub struct PendingHandle {
    id: String,
    deadline: Instant,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingHandle {
    /// Correlation id of the call
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instant after which the call counts as timed out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for PendingHandle {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without an outcome: the registry itself went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Registry of calls awaiting a response
#[derive(Debug, Default)]
pub struct PendingCallRegistry {
    calls: HashMap<String, PendingCall>,
}

impl PendingCallRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call that must be answered within `timeout`
    pub fn register(
        &mut self,
        id: impl Into<String>,
        method: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingHandle> {
        let id = id.into();
        if self.calls.contains_key(&id) {
            return Err(BridgeError::DuplicateId(id));
        }

        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id.clone(),
            PendingCall {
                method: method.into(),
                tx,
                started: now,
                deadline,
                timeout,
            },
        );

        Ok(PendingHandle { id, deadline, rx })
    }

    /// Fulfil a call; returns its round-trip time, or `None` if `id` is not pending
    pub fn resolve(&mut self, id: &str, payload: Value) -> Option<Duration> {
        let call = self.calls.remove(id)?;
        let elapsed = call.started.elapsed();
        // The caller may have stopped waiting; nothing to deliver to then
        let _ = call.tx.send(Ok(payload));
        Some(elapsed)
    }

    /// Fail a call; returns `false` if `id` is not pending
    pub fn reject(&mut self, id: &str, error: BridgeError) -> bool {
        match self.calls.remove(id) {
            Some(call) => {
                let _ = call.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove a call without delivering anything to it
    pub fn take(&mut self, id: &str) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Remove a call on behalf of its timed-out caller
    ///
    /// Returns the timeout error for the caller to surface, or `None` if the
    /// call was already settled (its outcome is then waiting in the handle).
    pub fn expire(&mut self, id: &str) -> Option<BridgeError> {
        let call = self.calls.remove(id)?;
        Some(timeout_error(id, &call))
    }

    /// Reject every call whose deadline is at or before `now`; returns their ids
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(call) = self.calls.remove(id) {
                debug!(id = %id, method = %call.method, "Pending call expired");
                let error = timeout_error(id, &call);
                let _ = call.tx.send(Err(error));
            }
        }

        expired
    }

    /// Reject every pending call, building each error from its id and method
    pub fn reject_all(&mut self, make_error: impl Fn(&str, &str) -> BridgeError) -> usize {
        let count = self.calls.len();
        for (id, call) in self.calls.drain() {
            let _ = call.tx.send(Err(make_error(&id, &call.method)));
        }
        count
    }

    /// Whether a call with this id is pending
    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    /// Method name of a pending call
    pub fn method_of(&self, id: &str) -> Option<&str> {
        self.calls.get(id).map(|call| call.method.as_str())
    }

    /// Number of pending calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are pending
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn timeout_error(id: &str, call: &PendingCall) -> BridgeError {
    BridgeError::Timeout {
        id: id.to_string(),
        method: call.method.clone(),
        timeout_ms: u64::try_from(call.timeout.as_millis()).unwrap_or(u64::MAX),
    }
}
