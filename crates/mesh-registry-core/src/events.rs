//! Listener plumbing for client-internal events.
//!
//! Subsystems that surface state changes (circuit transitions, rate-limit
//! degrades) emit through an [`EventListeners`] collection. A panicking
//! listener is isolated so the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Trait for listening to a subsystem's events.
pub trait EventListener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// A collection of shared listeners.
pub struct EventListeners<E> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Emits to every listener; a panicking listener does not prevent the
    /// others from receiving the event.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if result.is_err() {
                tracing::warn!("event listener panicked");
            }
        }
    }
}

/// Function-based listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _marker: std::marker::PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_all_listeners() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        let seen = count.clone();
        listeners.add(FnListener::new(move |_: &u32| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.emit(&7);
        listeners.emit(&8);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|_: &u32| panic!("listener")));
        let seen = count.clone();
        listeners.add(FnListener::new(move |_: &u32| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
