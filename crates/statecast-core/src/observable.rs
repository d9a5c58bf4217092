//! Observable values.
//!
//! A [`Bindable`] is the seam between whatever owns a piece of state and the
//! broadcasters that publish it. Owners call [`Bindable::set`]; observers are
//! notified only when the value actually changes.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: Option<T>,
    observers: Vec<(u64, Observer<T>)>,
    next_observer: u64,
}

/// A shared value that notifies observers on change.
///
/// Clones share the same value and observer list.
pub struct Bindable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Bindable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a bindable that has no value yet.
    #[must_use]
    pub fn new() -> Self {
        Self::from_option(None)
    }

    /// Create a bindable holding `value`.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        Self::from_option(Some(value))
    }

    fn from_option(value: Option<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                observers: Vec::new(),
                next_observer: 0,
            })),
        }
    }

    /// The current value, if one was ever set.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Replace the value and notify observers if it changed.
    ///
    /// Observers run on the calling thread after the value lock is released,
    /// so they may read the bindable.
    pub fn set(&self, value: T) {
        let observers: Vec<Observer<T>> = {
            let mut inner = self.inner.lock();
            if inner.value.as_ref() == Some(&value) {
                return;
            }
            inner.value = Some(value.clone());
            inner.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };

        for observer in observers {
            observer(&value);
        }
    }

    /// Register an observer for future changes.
    ///
    /// The observer stays registered until the returned [`Subscription`] is
    /// dropped or unsubscribed.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_observer;
            inner.next_observer += 1;
            inner.observers.push((id, Arc::new(observer)));
            id
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().observers.retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

impl<T> Default for Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Bindable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Bindable")
            .field("value", &inner.value)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

/// Keeps an observer registered. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the observer. Calling this more than once has no effect.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether the observer is still registered through this handle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
