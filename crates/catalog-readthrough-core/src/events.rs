//! Observability hooks.
//!
//! Components emit typed events into an [`EventListeners`] collection that
//! the embedding application fills with callbacks. Emission is synchronous
//! and runs on the caller's task, so listeners must be cheap.

use std::fmt;
use std::sync::Arc;

/// An event emitted by a read-path component.
pub trait Event: Send + Sync + fmt::Debug {
    /// Stable name of the event variant, e.g. `"circuit_opened"`.
    fn kind(&self) -> &'static str;

    /// Name of the component instance that emitted the event.
    fn source(&self) -> &str;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A cloneable set of callbacks for one event type.
pub struct EventListeners<E: Event> {
    callbacks: Vec<Callback<E>>,
}

impl<E: Event> EventListeners<E> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    /// Registers a callback invoked for every event.
    pub fn add<F>(&mut self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(f));
    }

    /// Registers a callback invoked only for events of the given kind.
    pub fn add_for<F>(&mut self, kind: &'static str, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(move |event: &E| {
            if event.kind() == kind {
                f(event);
            }
        }));
    }

    /// Delivers `event` to every callback.
    ///
    /// A panicking callback is isolated; the remaining callbacks still run.
    pub fn emit(&self, event: &E) {
        for callback in &self.callbacks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
            if outcome.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(event = event.kind(), source = event.source(), "event listener panicked");
            }
        }
    }

    /// Returns `true` if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }
}

impl<E: Event> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<E: Event> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.callbacks.len())
            .finish()
    }
}
