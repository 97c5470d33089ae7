//! Observable value store
//!
//! A `Readable<T>` holds a current value and notifies observers on every
//! change. Observers are called synchronously with the current value when
//! they subscribe. A readable created with [`Readable::with_start`] runs its
//! start function when the first observer arrives and the returned teardown
//! when the last one leaves; this is what ties a room channel's lifetime to
//! the views watching it.
//!
//! Async consumers can use [`Readable::watch`] instead of callbacks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Cleanup returned by a start function
pub type Teardown = Box<dyn FnOnce() + Send>;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type StartFn<T> = Box<dyn Fn(Setter<T>) -> Teardown + Send + Sync>;

struct Observer<T> {
    callback: Callback<T>,
    /// Set once the observer has been handed its initial value
    primed: bool,
}

struct Observers<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Observer<T>>,
    running: bool,
    teardown: Option<Teardown>,
}

struct Inner<T> {
    observers: Mutex<Observers<T>>,
    value: watch::Sender<T>,
    start: Option<StartFn<T>>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Observers<T>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, value: T) {
        self.set_if(value, || true);
    }

    /// Set `value` unless `keep` says otherwise; `keep` runs under the lock
    fn set_if(&self, value: T, keep: impl FnOnce() -> bool) {
        // Replacing under the lock orders this value against priming: an
        // observer primed earlier gets it here, one primed later reads it
        let callbacks: Vec<Callback<T>> = {
            let observers = self.lock();
            if !keep() {
                return;
            }
            self.value.send_replace(value.clone());
            observers
                .callbacks
                .values()
                .filter(|observer| observer.primed)
                .map(|observer| observer.callback.clone())
                .collect()
        };

        // Callbacks run without the lock held so they may subscribe or set
        for callback in callbacks {
            callback(&value);
        }
    }

    /// Hand observer `id` the current value, exactly once
    fn prime(&self, id: u64) -> Option<(Callback<T>, T)> {
        let mut observers = self.lock();
        let observer = observers.callbacks.get_mut(&id)?;
        observer.primed = true;
        Some((observer.callback.clone(), self.value.borrow().clone()))
    }

    fn remove(&self, id: u64) {
        let teardown = {
            let mut observers = self.lock();
            if observers.callbacks.remove(&id).is_none() {
                return;
            }
            if observers.callbacks.is_empty() && observers.running {
                // None while start is still in progress; it tears down itself
                let teardown = observers.teardown.take();
                if teardown.is_some() {
                    observers.running = false;
                }
                teardown
            } else {
                None
            }
        };

        if let Some(teardown) = teardown {
            teardown();
        }
    }
}

/// Read side of an observable value
pub struct Readable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Readable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Readable<T> {
    fn build(initial: T, start: Option<StartFn<T>>) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                observers: Mutex::new(Observers {
                    next_id: 0,
                    callbacks: BTreeMap::new(),
                    running: false,
                    teardown: None,
                }),
                value,
                start,
            }),
        }
    }

    /// A readable that never changes
    pub fn constant(value: T) -> Self {
        Self::build(value, None)
    }

    /// A readable paired with the setter that drives it
    pub fn writable(initial: T) -> (Self, Setter<T>) {
        let readable = Self::build(initial, None);
        let setter = readable.setter();
        (readable, setter)
    }

    /// A readable whose `start` runs on the first subscription.
    ///
    /// The teardown `start` returns runs once the last subscription is
    /// dropped. A later subscriber runs `start` again.
    pub fn with_start<F>(initial: T, start: F) -> Self
    where
        F: Fn(Setter<T>) -> Teardown + Send + Sync + 'static,
    {
        Self::build(initial, Some(Box::new(start)))
    }

    fn setter(&self) -> Setter<T> {
        Setter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Receiver for async consumers.
    ///
    /// A watch receiver does not count as an observer: it never triggers
    /// `start`, so pair it with a [`Subscription`] on lazily-started readables.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.value.subscribe()
    }

    /// Number of live subscriptions
    pub fn observer_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Register `callback`, invoking it immediately with the current value.
    ///
    /// The callback sees the current value once, then every later change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);

        let (id, first) = {
            let mut observers = self.inner.lock();
            let id = observers.next_id;
            observers.next_id += 1;
            observers.callbacks.insert(
                id,
                Observer {
                    callback,
                    primed: false,
                },
            );

            let first = self.inner.start.is_some() && !observers.running;
            if first {
                observers.running = true;
            }
            (id, first)
        };

        if first && let Some(start) = &self.inner.start {
            let teardown = start(self.setter());

            let mut observers = self.inner.lock();
            if observers.callbacks.is_empty() {
                observers.running = false;
                drop(observers);
                teardown();
            } else {
                observers.teardown = Some(teardown);
            }
        }

        // Values set by `start` are folded into this single initial call
        if let Some((callback, value)) = self.inner.prime(id) {
            callback(&value);
        }

        // Keeps the store alive so its teardown runs even if every Readable is dropped
        let inner = self.inner.clone();
        Subscription {
            cancel: Some(Box::new(move || inner.remove(id))),
        }
    }
}

/// Write side of an observable value.
///
/// Holds the store weakly; setting a value on a dropped store is a no-op.
pub struct Setter<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Setter<T> {
    pub fn set(&self, value: T) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set(value);
        }
    }

    /// Set `value` only if `keep` holds at the moment of the write.
    ///
    /// `keep` runs while the store is locked, so it must not touch the store.
    pub fn set_if(&self, value: T, keep: impl FnOnce() -> bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_if(value, keep);
        }
    }
}

/// Handle to a registered observer; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
