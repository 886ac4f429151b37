//! A single observer primitive used everywhere the original design mixed
//! event emitters and ad hoc callbacks (spec §9, Design Notes). Subscribers
//! register a closure and get back a handle; dropping the handle
//! unsubscribes. No global bus — each component owns its own `Observable`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A point other components can subscribe to for typed events of type `T`.
pub struct Observable<T> {
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Observable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`, returning a handle that unsubscribes it when
    /// dropped.
    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Box::new(listener)));
        Subscription {
            observable: Arc::clone(self),
            id,
        }
    }

    /// Invokes every currently-subscribed listener with `event`.
    pub fn emit(&self, event: &T) {
        for (_, listener) in self.listeners.read().iter() {
            listener(event);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// An active subscription to an [`Observable`]. Unsubscribes on drop.
pub struct Subscription<T> {
    observable: Arc<Observable<T>>,
    id: u64,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.observable.listeners.write().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn emits_to_all_subscribers() {
        let observable: Arc<Observable<u32>> = Arc::new(Observable::new());
        let sum = Arc::new(AtomicU32::new(0));

        let sum_a = Arc::clone(&sum);
        let _sub_a = observable.subscribe(move |event| {
            sum_a.fetch_add(*event, Ordering::SeqCst);
        });
        let sum_b = Arc::clone(&sum);
        let _sub_b = observable.subscribe(move |event| {
            sum_b.fetch_add(*event, Ordering::SeqCst);
        });

        observable.emit(&5);
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let observable: Arc<Observable<u32>> = Arc::new(Observable::new());
        let count = Arc::new(AtomicU32::new(0));

        let count_clone = Arc::clone(&count);
        let sub = observable.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        observable.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(sub);
        observable.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observable.listener_count(), 0);
    }
}
