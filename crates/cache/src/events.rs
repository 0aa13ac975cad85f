//! Observer registration for engine events
//!
//! Components publish through an [`EventBus`]. Listeners are either callbacks
//! or channel receivers. Emission snapshots the listener list and delivers
//! with no bus lock held, so a listener may subscribe, unsubscribe or call
//! back into the component that emitted.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{CacheKind, CacheStats};

/// Handle returned by [`EventBus::listen`]
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events to callbacks and channels
pub struct EventBus<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    channels: Mutex<Vec<Sender<E>>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback invoked for every event
    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    /// Open an unbounded channel receiving every subsequent event
    ///
    /// Dropping the receiver unsubscribes it on the next emission.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.channels.lock().push(tx);
        rx
    }

    /// Number of callbacks plus open channels
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len() + self.channels.lock().len()
    }

    /// Deliver an event to every listener
    ///
    /// Must not be called while the emitter holds its own state lock.
    pub fn emit(&self, event: E) {
        let listeners: Vec<Listener<E>> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!("event listener panicked");
            }
        }

        let channels: Vec<Sender<E>> = self.channels.lock().clone();
        if channels.is_empty() {
            return;
        }
        let dead: Vec<&Sender<E>> = channels
            .iter()
            .filter(|tx| tx.send(event.clone()).is_err())
            .collect();
        if !dead.is_empty() {
            self.channels
                .lock()
                .retain(|tx| !dead.iter().any(|d| d.same_channel(tx)));
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events published by the cache registry
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// Total cache usage went over the global limit
    MemoryLimitExceeded { usage: i64, limit: i64 },
    /// Cache usage ratio reached the warning threshold
    PressureDetected { ratio: f64 },
    /// System memory ratio crossed the system threshold
    SystemPressureDetected { ratio: f64 },
    PressureWarning { ratio: f64 },
    PressureCritical { ratio: f64 },
    /// Periodic per-cache statistics
    StatsUpdated { kind: CacheKind, stats: CacheStats },
    /// Periodic aggregate statistics
    GlobalStatsUpdated { total_usage: i64, hit_ratio: f64 },
    /// The registry asked a cache to free bytes
    EvictionRequested { kind: CacheKind, bytes: i64 },
    EmergencyEvictionTriggered { bytes_freed: i64 },
    ConfigChanged,
    OptimizationCompleted { bytes_freed: i64 },
    CompressionCompleted { bytes_saved: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_listener() {
        let bus: EventBus<CacheEvent> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(CacheEvent::ConfigChanged);
        bus.emit(CacheEvent::ConfigChanged);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(bus.unlisten(id));
        assert!(!bus.unlisten(id));
        bus.emit(CacheEvent::ConfigChanged);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_subscriber() {
        let bus: EventBus<CacheEvent> = EventBus::new();
        let rx = bus.subscribe();

        bus.emit(CacheEvent::PressureDetected { ratio: 0.8 });
        assert_eq!(rx.try_recv(), Ok(CacheEvent::PressureDetected { ratio: 0.8 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus: EventBus<CacheEvent> = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        drop(rx);
        bus.emit(CacheEvent::ConfigChanged);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_reenter_bus() {
        let bus: Arc<EventBus<CacheEvent>> = Arc::new(EventBus::new());
        let inner = Arc::downgrade(&bus);
        bus.listen(move |_| {
            if let Some(bus) = inner.upgrade() {
                bus.listen(|_| {});
            }
        });

        bus.emit(CacheEvent::ConfigChanged);
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus: EventBus<CacheEvent> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.listen(|_| panic!("listener failure"));
        bus.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(CacheEvent::ConfigChanged);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
