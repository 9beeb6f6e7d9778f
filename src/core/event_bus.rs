//! Pub/Sub event bus for decoupled observation of the cache core.
//!
//! Components subscribe to event types with callbacks, invoked immediately
//! on `emit`. Events are also queued so a consumer can `poll()` them in a
//! batch on its own schedule. Callback order is FIFO (first-subscribed,
//! first-called) within a single event type; cross-type order is undefined.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Maximum queued events before the oldest half is evicted.
const MAX_QUEUE_SIZE: usize = 1000;

/// Marker trait for events. Events must be `Send + Sync + 'static`.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Boxed event for queue storage.
pub type BoxedEvent = Box<dyn Event>;

/// Pub/sub event bus with deferred (polled) processing support.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to events of type `E`. Callback runs synchronously inside
    /// `emit`, so it must not block or re-enter the bus.
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<E>();
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(type_id)
            .or_default()
            .push(wrapped);
    }

    /// Invoke callbacks immediately and queue the event for `poll()`.
    pub fn emit<E: Event + Clone>(&self, event: E) {
        let type_id = TypeId::of::<E>();

        if let Some(cbs) = self.subscribers.read().unwrap_or_else(|e| e.into_inner()).get(&type_id) {
            for cb in cbs {
                cb(&event);
            }
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(0..evict_count);
        }
        queue.push(Box::new(event));
    }

    /// Return all events queued since the last `poll()`.
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn unsubscribe_all<E: Event>(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Downcast a `BoxedEvent` back to its concrete type.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

// ===========================================================================
// Produced events (spec §6 "Event Bus (produced)")
// ===========================================================================

use crate::key::FrameKey;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHitEvent {
    pub key: FrameKey,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheMissEvent {
    pub key: FrameKey,
    pub load_elapsed_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsageEvent {
    pub resident_bytes: u64,
    pub hard_limit_bytes: u64,
    pub usage_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceWarningEvent {
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadPausedEvent {
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadResumedEvent;

/// Emitted once per sustained-violation episode (spec §4.6 automatic
/// actions), after the forced cleanup and preload-window shrink it
/// describes have already run. Distinct from `PerformanceWarningEvent`
/// because it reports a compound corrective action, not just a threshold
/// crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SustainedViolationEvent {
    pub metric: &'static str,
    pub consecutive_violations: usize,
    pub entries_freed: usize,
}

// ===========================================================================
// Consumed events (spec §6 "Event Bus (consumed)")
// ===========================================================================

use crate::core::predictor::Direction;
use crate::key::FrameRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChangedEvent {
    pub current_key: FrameKey,
    pub previous_key: Option<FrameKey>,
    pub direction_hint: Option<Direction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectOpenedEvent {
    pub frame_range: FrameRange,
}
