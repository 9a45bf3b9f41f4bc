//! Module event bus
//!
//! Delivers board-level notifications to any number of subscribers. Each
//! subscription owns its own unbounded queue, so a slow subscriber never
//! holds up publication to the others. Events of one type reach a
//! subscriber in publish order; no order is kept across types.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use boe_core::{BoeError, Result};

/// Exclusive lower bound of the reserved event range
pub const EVENT_BASE: u32 = 100;

/// Exclusive upper bound of the reserved event range
pub const EVENT_MAX: u32 = 105;

/// Event types reserved for the BOE module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventType {
    /// Flashing progressed to a new percentage
    UpgradeProgress = 101,
    /// A firmware update finished, successfully or not
    UpgradeFinished = 102,
    /// A firmware update was aborted
    UpgradeAborted = 103,
    /// The device session was released
    SessionReleased = 104,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UpgradeProgress,
        EventType::UpgradeFinished,
        EventType::UpgradeAborted,
        EventType::SessionReleased,
    ];

    /// Numeric event code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Resolve a raw event code
    ///
    /// Codes on or outside the range bounds are rejected with
    /// [`BoeError::UnknownEvent`].
    pub fn from_code(code: u32) -> Result<Self> {
        if code <= EVENT_BASE || code >= EVENT_MAX {
            return Err(BoeError::UnknownEvent(code));
        }
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or(BoeError::UnknownEvent(code))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// An event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEvent {
    pub event_type: EventType,
    /// Opaque event data
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ModuleEvent {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

type Subscribers = HashMap<EventType, Vec<(Uuid, mpsc::UnboundedSender<ModuleEvent>)>>;

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Subscribers>,
    closed: AtomicBool,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, event_type: EventType, id: Uuid) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(&event_type) {
            list.retain(|(sid, _)| *sid != id);
        }
    }
}

/// Publish/subscribe channel for module events
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event type
    ///
    /// After [`EventBus::close`] the returned stream has already ended.
    pub fn subscribe(&self, event_type: EventType) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        {
            let mut subscribers = self.inner.lock();
            if self.inner.closed.load(Ordering::SeqCst) {
                debug!("Subscription {} to {} on a closed bus", id, event_type);
            } else {
                subscribers.entry(event_type).or_default().push((id, tx));
                debug!("Subscription {} registered for {}", id, event_type);
            }
        }

        Subscription {
            id,
            event_type,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event to every subscriber of its type
    ///
    /// Never blocks. Returns the number of subscribers the event was queued
    /// for; subscribers whose receiving end is gone are pruned.
    pub fn publish(&self, event: ModuleEvent) -> usize {
        let mut subscribers = self.inner.lock();
        let Some(list) = subscribers.get_mut(&event.event_type) else {
            return 0;
        };
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        list.len()
    }

    /// Number of live subscriptions for a type
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .lock()
            .get(&event_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Tear the bus down
    ///
    /// Subscribers keep events already queued and then see the end of their
    /// stream.
    pub fn close(&self) {
        let mut subscribers = self.inner.lock();
        self.inner.closed.store(true, Ordering::SeqCst);
        subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A subscriber's handle on one event type
///
/// Dropping the handle cancels the subscription.
pub struct Subscription {
    id: Uuid,
    event_type: EventType,
    rx: mpsc::UnboundedReceiver<ModuleEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Wait for the next event; `None` once the bus is torn down and drained
    pub async fn recv(&mut self) -> Option<ModuleEvent> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<ModuleEvent> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.event_type, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .finish()
    }
}
