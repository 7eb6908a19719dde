//! Per-key tracking of fetches in progress.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;

/// How a caller relates to the fetch for its key.
pub(crate) enum Role<T> {
    /// No fetch was running; the caller must start one and hand the
    /// [`Completion`] to it.
    Leader(broadcast::Receiver<T>, Completion<T>),
    /// A fetch is already running; its result arrives on the receiver.
    Waiter(broadcast::Receiver<T>),
}

/// Map from key to the broadcast sender of that key's running fetch.
pub(crate) struct InFlight<K, T> {
    requests: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

impl<K, T> InFlight<K, T>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to the fetch for `key`, registering a new one if none is
    /// running.
    pub(crate) fn join(self: &Arc<Self>, key: &K) -> Role<T> {
        let mut requests = self.requests.lock();
        if let Some(sender) = requests.get(key) {
            return Role::Waiter(sender.subscribe());
        }
        // One message per key lifetime.
        let (tx, rx) = broadcast::channel(1);
        requests.insert(key.clone(), tx);
        let completion = Completion {
            finish: Some(Box::new({
                let in_flight = Arc::clone(self);
                let key = key.clone();
                move |value| in_flight.finish(&key, value)
            })),
        };
        Role::Leader(rx, completion)
    }

    fn finish(&self, key: &K, value: Option<T>) {
        let sender = self.requests.lock().remove(key);
        if let (Some(sender), Some(value)) = (sender, value) {
            // No receivers left is fine.
            let _ = sender.send(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

type Finish<T> = Box<dyn FnOnce(Option<T>) + Send>;

/// Obligation to publish the result of a registered fetch.
///
/// Dropping it without calling [`complete`](Completion::complete) removes the
/// key without a value; waiters then see the channel close.
pub(crate) struct Completion<T> {
    finish: Option<Finish<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn complete(mut self, value: T) {
        if let Some(finish) = self.finish.take() {
            finish(Some(value));
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(finish) = self.finish.take() {
            finish(None);
        }
    }
}
