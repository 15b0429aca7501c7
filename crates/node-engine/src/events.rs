//! Engine events and the publish/subscribe bus
//!
//! Registries and the executor announce lifecycle changes through the
//! [`EventSink`] trait. The production sink is [`EventBus`]: publishing is
//! fire-and-forget (the event is queued on a bounded channel and never blocks
//! the publisher) and a dedicated dispatcher thread delivers it to every
//! subscriber registered at publish time. Each subscriber call is isolated;
//! its errors and panics are logged and never reach other subscribers or the
//! publisher.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Trait for sending engine events
///
/// This abstracts over the transport so registries can be tested with
/// [`VecEventSink`] and hosted with [`EventBus`].
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be queued (e.g., channel closed)
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Errors from the event layer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EventError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Event channel full; event dropped")]
    ChannelFull,

    #[error("Timed out after {0:?} waiting for event")]
    Timeout(Duration),

    /// Raised by a subscriber; logged by the dispatcher
    #[error("Subscriber error: {0}")]
    Subscriber(String),
}

/// Events emitted by the registries and the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    PluginRegistered { node_type: String, version: String },

    #[serde(rename_all = "camelCase")]
    PluginUnregistered { node_type: String },

    #[serde(rename_all = "camelCase")]
    PluginEnabledChanged { node_type: String, enabled: bool },

    #[serde(rename_all = "camelCase")]
    SchemaRegistered { node_type: String, variable_count: usize },

    #[serde(rename_all = "camelCase")]
    RuntimeVariablesRegistered { node_id: String, variable_count: usize },

    #[serde(rename_all = "camelCase")]
    RuntimeVariablesInvalidated { node_id: String },

    #[serde(rename_all = "camelCase")]
    RuntimeVariablesCleared { node_count: usize },

    #[serde(rename_all = "camelCase")]
    FlowStarted {
        flow_id: String,
        execution_id: String,
        node_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    NodeStarted {
        flow_id: String,
        execution_id: String,
        node_id: String,
        node_type: String,
    },

    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        flow_id: String,
        execution_id: String,
        node_id: String,
        duration_ms: u64,
        output: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    NodeFailed {
        flow_id: String,
        execution_id: String,
        node_id: String,
        error: String,
    },

    /// Node sits on a branch that was not taken
    #[serde(rename_all = "camelCase")]
    NodeSkipped {
        flow_id: String,
        execution_id: String,
        node_id: String,
    },

    #[serde(rename_all = "camelCase")]
    FlowCompleted {
        flow_id: String,
        execution_id: String,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    FlowFailed {
        flow_id: String,
        execution_id: String,
        error: String,
    },
}

/// Discriminant of [`EngineEvent`], used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PluginRegistered,
    PluginUnregistered,
    PluginEnabledChanged,
    SchemaRegistered,
    RuntimeVariablesRegistered,
    RuntimeVariablesInvalidated,
    RuntimeVariablesCleared,
    FlowStarted,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    FlowCompleted,
    FlowFailed,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PluginRegistered { .. } => EventKind::PluginRegistered,
            Self::PluginUnregistered { .. } => EventKind::PluginUnregistered,
            Self::PluginEnabledChanged { .. } => EventKind::PluginEnabledChanged,
            Self::SchemaRegistered { .. } => EventKind::SchemaRegistered,
            Self::RuntimeVariablesRegistered { .. } => EventKind::RuntimeVariablesRegistered,
            Self::RuntimeVariablesInvalidated { .. } => EventKind::RuntimeVariablesInvalidated,
            Self::RuntimeVariablesCleared { .. } => EventKind::RuntimeVariablesCleared,
            Self::FlowStarted { .. } => EventKind::FlowStarted,
            Self::NodeStarted { .. } => EventKind::NodeStarted,
            Self::NodeCompleted { .. } => EventKind::NodeCompleted,
            Self::NodeFailed { .. } => EventKind::NodeFailed,
            Self::NodeSkipped { .. } => EventKind::NodeSkipped,
            Self::FlowCompleted { .. } => EventKind::FlowCompleted,
            Self::FlowFailed { .. } => EventKind::FlowFailed,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events synchronously
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Count collected events of one kind
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Identifier returned by [`EventBus::subscribe`]
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&EngineEvent) -> Result<(), EventError> + Send + Sync>;
type Matcher = Arc<dyn Fn(&EngineEvent) -> bool + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    matches: Matcher,
    once: bool,
    handler: Handler,
}

struct Envelope {
    event: EngineEvent,
    targets: Vec<Arc<Subscriber>>,
}

/// In-process publish/subscribe bus
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    tx: mpsc::Sender<Envelope>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with a bounded queue of `capacity` pending events
    ///
    /// Delivery happens on a dedicated thread, so the bus works with or
    /// without a tokio runtime. The thread exits when the bus is dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

        let spawned = std::thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || {
                while let Some(envelope) = rx.blocking_recv() {
                    deliver(envelope);
                }
                log::debug!("EventBus: dispatcher stopped");
            });
        if let Err(e) = spawned {
            // rx was moved into the failed closure and dropped, so every
            // publish now reports ChannelClosed
            log::error!("EventBus: failed to start dispatcher thread: {}", e);
        }

        Self {
            subscribers: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to one kind of event
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&EngineEvent) -> Result<(), EventError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add(Arc::new(move |e: &EngineEvent| e.kind() == kind), false, Arc::new(handler))
    }

    /// Subscribe to every event
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&EngineEvent) -> Result<(), EventError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add(Arc::new(|_: &EngineEvent| true), false, Arc::new(handler))
    }

    /// Subscribe for the next event of `kind` only
    pub fn once(
        &self,
        kind: EventKind,
        handler: impl Fn(&EngineEvent) -> Result<(), EventError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add(Arc::new(move |e: &EngineEvent| e.kind() == kind), true, Arc::new(handler))
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Queue an event for delivery without blocking
    pub fn publish(&self, event: EngineEvent) -> Result<(), EventError> {
        let targets: Vec<Arc<Subscriber>> = {
            let mut subs = self.subscribers.write();
            let targets: Vec<Arc<Subscriber>> =
                subs.iter().filter(|s| (s.matches)(&event)).cloned().collect();
            // One-shot subscribers are consumed by the publish that selects them
            if targets.iter().any(|s| s.once) {
                subs.retain(|s| !(s.once && (s.matches)(&event)));
            }
            targets
        };

        if targets.is_empty() {
            return Ok(());
        }

        match self.tx.try_send(Envelope { event, targets }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                log::warn!("EventBus: queue full, dropping {:?}", envelope.event.kind());
                Err(EventError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EventError::ChannelClosed),
        }
    }

    /// Wait for the next event of `kind`
    ///
    /// The subscription is registered when this is called, so an event
    /// published before the returned future is first polled still counts.
    pub fn wait_for(
        &self,
        kind: EventKind,
        timeout: Duration,
    ) -> impl Future<Output = Result<EngineEvent, EventError>> + Send + '_ {
        self.wait_for_where(move |e| e.kind() == kind, timeout)
    }

    /// Wait for the next event matching `predicate`
    ///
    /// The temporary subscription is removed when the wait resolves, times
    /// out or the future is dropped.
    pub fn wait_for_where(
        &self,
        predicate: impl Fn(&EngineEvent) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> impl Future<Output = Result<EngineEvent, EventError>> + Send + '_ {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.add(
            Arc::new(predicate),
            true,
            Arc::new(move |event: &EngineEvent| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.clone());
                }
                Ok(())
            }),
        );
        let guard = SubscriptionGuard { bus: self, id };

        async move {
            let result = tokio::time::timeout(timeout, rx).await;
            drop(guard);

            match result {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(EventError::ChannelClosed),
                Err(_) => Err(EventError::Timeout(timeout)),
            }
        }
    }

    fn add(&self, matches: Matcher, once: bool, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Arc::new(Subscriber {
            id,
            matches,
            once,
            handler,
        }));
        id
    }
}

/// Removes a temporary subscription when dropped
struct SubscriptionGuard<'a> {
    bus: &'a EventBus,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::constants::limits::EVENT_CHANNEL_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.publish(event)
    }
}

fn deliver(envelope: Envelope) {
    let Envelope { event, targets } = envelope;
    for subscriber in targets {
        match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!(
                "EventBus: subscriber {} failed on {:?}: {}",
                subscriber.id,
                event.kind(),
                e
            ),
            Err(_) => log::error!(
                "EventBus: subscriber {} panicked on {:?}",
                subscriber.id,
                event.kind()
            ),
        }
    }
}
