//! Typed event channels for sources, sinks and pipelines
//!
//! Every stage owns an [`EventBus`] per event type. Any number of observers
//! can subscribe with [`EventBus::on`] or [`EventBus::once`]; the bus can be
//! cloned and emitted from any task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::error::StreamError;
use super::state::PipelineState;

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Callback<E> = Arc<Mutex<dyn FnMut(&E) + Send>>;

struct Listener<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Listener<E>>>,
}

/// Explicit listener list for one event type
pub struct EventBus<E> {
    shared: Arc<Listeners<E>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Listeners {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe for every future event
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(false, Arc::new(Mutex::new(callback)))
    }

    /// Subscribe for the next event only
    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(true, Arc::new(Mutex::new(callback)))
    }

    /// Remove a listener; returns false if it was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|l| l.id != id);
        entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver an event to every listener, in subscription order
    ///
    /// The listener list is snapshotted under the lock and `once` listeners
    /// are claimed by exactly one emitter. Callbacks run outside the list
    /// lock, so a callback may subscribe or unsubscribe; it must not emit on
    /// its own bus.
    pub fn emit(&self, event: &E) {
        let fired: Vec<Callback<E>> = {
            let mut entries = self.lock();
            let fired = entries.iter().map(|l| Arc::clone(&l.callback)).collect();
            entries.retain(|l| !l.once);
            fired
        };

        for callback in fired {
            let mut callback = callback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (&mut *callback)(event);
        }
    }

    fn register(&self, once: bool, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Listener { id, once, callback });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener<E>>> {
        // a panicking listener must not silence the bus for everyone else
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Events emitted by a chunk source
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A chunk of the given size was handed out
    Data { size: usize },
    Paused,
    Resumed,
    /// Graceful end of stream
    Ended,
    /// Fatal source failure
    Errored(Arc<StreamError>),
    /// Underlying resource released
    Closed,
}

/// Events emitted by a chunk sink
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Buffer fell to the low-water mark, safe to write again
    Drain,
    /// All written data flushed after `end()`
    Finish,
    /// Underlying resource released
    Close,
    /// Fatal sink failure, no further writes permitted
    Error(Arc<StreamError>),
}

/// Events emitted by a backpressure controller for its link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Sink reported full, source paused
    Paused,
    /// Sink drained (and any throttle elapsed), source resumed
    Resumed,
}

/// Events emitted by a running pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    /// The sink was detached mid-flight
    Unpiped,
    Finished,
    Errored(Arc<StreamError>),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_and_once() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let all = seen.clone();
        bus.on(move |v| all.lock().unwrap().push(("on", *v)));
        let first = seen.clone();
        bus.once(move |v| first.lock().unwrap().push(("once", *v)));

        bus.emit(&1);
        bus.emit(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("on", 1), ("once", 1), ("on", 2)]
        );
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_off() {
        let bus = EventBus::<()>::new();
        let id = bus.on(|_| {});
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_subscribe_from_callback() {
        let bus = EventBus::<u8>::new();
        let inner = bus.clone();
        bus.once(move |_| {
            inner.on(|_| {});
        });

        bus.emit(&0);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_concurrent_emitters_reach_every_listener() {
        use std::sync::atomic::AtomicUsize;

        let bus = EventBus::<usize>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let claimed = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        bus.on(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let first = claimed.clone();
        bus.once(move |_| {
            first.fetch_add(1, Ordering::Relaxed);
        });

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let bus = bus.clone();
                scope.spawn(move || {
                    for i in 0..10_000 {
                        bus.emit(&i);
                    }
                });
            }
        });

        assert_eq!(seen.load(Ordering::Relaxed), 40_000);
        assert_eq!(claimed.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(), 1);
    }
}
