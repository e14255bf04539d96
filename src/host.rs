//! Host proxy object.
//!
//! Application code never reaches for a global: it is handed a
//! [`HostProxy`], built from the driver, and reads host context through it.
//! The context is a whole-value snapshot that the bridge swaps atomically on
//! the handshake response and on every context-changed event.

use crate::driver::{BridgeFuture, FrameDriver};
use crate::error::{BridgeError, Result};
use crate::events::Subscription;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Method name used by [`HostProxy::navigate`]
pub const NAVIGATE_METHOD: &str = "navigate";

/// Event name used by [`HostProxy::report_status`]
pub const STATUS_EVENT: &str = "status";

/// Context provided by the host platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostContext {
    /// Item currently open in the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<Value>,

    /// Dataset the item belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dataset: Option<Value>,

    /// Signed-in user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,

    /// Panel settings chosen in the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,

    /// Any other fields the host sends (tokens, viewport, locale, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HostContext {
    /// Build a context from a handshake or context-changed payload
    ///
    /// A `null` payload (bare acknowledgement) yields an empty context.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Ok(serde_json::from_value(payload.clone())?),
            other => Err(BridgeError::Serialization(format!(
                "host context must be an object, got {}",
                json_type(other)
            ))),
        }
    }

    /// Look up any field by its wire name
    pub fn get(&self, key: &str) -> Option<&Value> {
        match key {
            "currentItem" => self.current_item.as_ref(),
            "currentDataset" => self.current_dataset.as_ref(),
            "user" => self.user.as_ref(),
            "settings" => self.settings.as_ref(),
            other => self.extra.get(other),
        }
    }

    /// Id of the current item, whether sent as a bare id or an object
    pub fn current_item_id(&self) -> Option<&str> {
        entity_id(self.current_item.as_ref()?)
    }

    /// Id of the current dataset, whether sent as a bare id or an object
    pub fn current_dataset_id(&self) -> Option<&str> {
        entity_id(self.current_dataset.as_ref()?)
    }
}

fn entity_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Holder of the current context snapshot
#[derive(Debug, Default)]
pub struct ContextStore {
    current: RwLock<Arc<HostContext>>,
    version: AtomicU64,
}

impl ContextStore {
    /// Create a store holding an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<HostContext> {
        Arc::clone(&*self.current.read())
    }

    /// Replace the whole snapshot
    pub fn replace(&self, context: HostContext) {
        *self.current.write() = Arc::new(context);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Number of replacements so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Lifecycle status reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelStatus {
    /// Panel is loading its content
    Loading,
    /// Panel is interactive
    Ready,
    /// Panel failed to load or render
    Error,
}

/// Typed access to host capabilities
#[derive(Clone)]
pub struct HostProxy {
    driver: FrameDriver,
}

impl HostProxy {
    pub(crate) fn new(driver: FrameDriver) -> Self {
        Self { driver }
    }

    /// The current context snapshot
    pub fn context(&self) -> Arc<HostContext> {
        self.driver.context_store().snapshot()
    }

    /// Number of context updates received so far
    pub fn context_version(&self) -> u64 {
        self.driver.context_store().version()
    }

    /// Item currently open in the host
    pub fn current_item(&self) -> Option<Value> {
        self.context().current_item.clone()
    }

    /// Dataset currently open in the host
    pub fn current_dataset(&self) -> Option<Value> {
        self.context().current_dataset.clone()
    }

    /// Signed-in user
    pub fn user(&self) -> Option<Value> {
        self.context().user.clone()
    }

    /// Panel settings
    pub fn settings(&self) -> Option<Value> {
        self.context().settings.clone()
    }

    /// Any context field by wire name
    pub fn get(&self, key: &str) -> Option<Value> {
        self.context().get(key).cloned()
    }

    /// Call a host method
    pub fn call(&self, method: &str, args: Value) -> BridgeFuture<Value> {
        self.driver.call(method, args)
    }

    /// Call a host method with typed arguments and result
    pub fn call_as<A, T>(&self, method: &str, args: &A) -> BridgeFuture<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        let pending = match serde_json::to_value(args) {
            Ok(args) => self.driver.call(method, args),
            Err(e) => return Box::pin(async move { Err(BridgeError::from(e)) }),
        };
        Box::pin(async move {
            let value = pending.await?;
            Ok(serde_json::from_value(value)?)
        })
    }

    /// Subscribe to a host event
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.driver.on(event, handler)
    }

    /// Send an event to the host
    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.driver.emit(event, payload)
    }

    /// Ask the host to navigate to a route
    pub fn navigate(&self, route: &str, params: Value) -> BridgeFuture<Value> {
        self.driver
            .call(NAVIGATE_METHOD, json!({ "route": route, "params": params }))
    }

    /// Report the panel's status to the host
    pub fn report_status(&self, status: PanelStatus, message: Option<&str>) -> Result<()> {
        let mut payload = json!({ "status": status });
        if let Some(message) = message {
            payload["message"] = Value::String(message.to_string());
        }
        self.driver.emit(STATUS_EVENT, payload)
    }
}
