//! Broadcasters.
//!
//! A broadcaster owns one stream key and knows the stream's current value.
//! Three flavours cover the ways state gets published:
//!
//! - [`BoundBroadcaster`] follows a [`Bindable`] and republishes on change,
//!   coalescing bursts so only the newest value is guaranteed to go out;
//! - [`ManualBroadcaster`] is driven by explicit calls;
//! - [`ThrottledBroadcaster`] is a manual broadcaster that drops calls
//!   arriving too soon after the previous broadcast.
//!
//! All of them unregister from the [`Multiplexer`] when dropped.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::multiplexer::{Multiplexer, MultiplexerError};
use crate::observable::{Bindable, Subscription};

/// Minimum spacing between throttled broadcasts unless configured otherwise.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(500);

/// A named stream with a current value.
pub trait Broadcaster: Send + Sync + 'static {
    /// The stream key.
    fn type_key(&self) -> &str;

    /// The value a newly attached observer should see, if any.
    fn current(&self) -> Option<Value>;
}

type Projection<T> = Box<dyn Fn(&T) -> Option<Value> + Send + Sync>;

struct BoundState<T> {
    key: String,
    source: Bindable<T>,
    project: Projection<T>,
}

impl<T> Broadcaster for BoundState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn type_key(&self) -> &str {
        &self.key
    }

    fn current(&self) -> Option<Value> {
        let value = self.source.value()?;
        (self.project)(&value)
    }
}

/// Publishes a [`Bindable`] under a stream key whenever it changes.
///
/// Changes only wake a flush task; the flush reads the value when it runs.
/// A burst of changes therefore yields at least one broadcast carrying the
/// final value and never a stale value after a newer one.
pub struct BoundBroadcaster {
    key: String,
    multiplexer: Multiplexer,
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl BoundBroadcaster {
    /// Register a broadcaster that publishes `project(value)` for every
    /// change of `source`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateKey`] if `key` is taken.
    pub fn spawn<T, U, F>(
        multiplexer: &Multiplexer,
        key: impl Into<String>,
        source: Bindable<T>,
        project: F,
    ) -> Result<Self, MultiplexerError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        U: Serialize,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let key = key.into();
        let projection_key = key.clone();
        let state = Arc::new(BoundState {
            key: key.clone(),
            source: source.clone(),
            project: Box::new(move |value: &T| match serde_json::to_value(project(value)) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(key = %projection_key, error = %e, "Failed to serialize stream value");
                    None
                }
            }),
        });

        multiplexer.register(state.clone())?;

        let notify = Arc::new(Notify::new());
        let subscription = {
            let notify = Arc::clone(&notify);
            source.subscribe(move |_| notify.notify_one())
        };

        let task = tokio::spawn(flush(multiplexer.clone(), state, notify));
        debug!(key = %key, "Bound broadcaster started");

        Ok(Self {
            key,
            multiplexer: multiplexer.clone(),
            subscription,
            task,
        })
    }

    /// Register a broadcaster that publishes the value of `source` as is.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateKey`] if `key` is taken.
    pub fn identity<T>(
        multiplexer: &Multiplexer,
        key: impl Into<String>,
        source: Bindable<T>,
    ) -> Result<Self, MultiplexerError>
    where
        T: Clone + PartialEq + Serialize + Send + Sync + 'static,
    {
        Self::spawn(multiplexer, key, source, T::clone)
    }

    /// The stream key.
    #[must_use]
    pub fn type_key(&self) -> &str {
        &self.key
    }

    /// Stop following the source and unregister.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BoundBroadcaster {
    fn drop(&mut self) {
        self.multiplexer.unregister(&self.key);
        self.subscription.unsubscribe();
        self.task.abort();
        debug!(key = %self.key, "Bound broadcaster stopped");
    }
}

async fn flush<T>(multiplexer: Multiplexer, state: Arc<BoundState<T>>, notify: Arc<Notify>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    loop {
        notify.notified().await;
        if let Err(e) = multiplexer.emit(state.as_ref()) {
            warn!(key = %state.key, error = %e, "State broadcast failed");
        }
    }
}

struct ManualState {
    key: String,
    last: Mutex<Option<Value>>,
}

impl Broadcaster for ManualState {
    fn type_key(&self) -> &str {
        &self.key
    }

    fn current(&self) -> Option<Value> {
        self.last.lock().clone()
    }
}

/// A broadcaster driven by explicit calls.
///
/// The last value sent is what newly attached observers receive.
pub struct ManualBroadcaster {
    state: Arc<ManualState>,
    multiplexer: Multiplexer,
}

impl ManualBroadcaster {
    /// Register under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateKey`] if `key` is taken.
    pub fn register(
        multiplexer: &Multiplexer,
        key: impl Into<String>,
    ) -> Result<Self, MultiplexerError> {
        let state = Arc::new(ManualState {
            key: key.into(),
            last: Mutex::new(None),
        });
        multiplexer.register(state.clone())?;

        Ok(Self {
            state,
            multiplexer: multiplexer.clone(),
        })
    }

    /// The stream key.
    #[must_use]
    pub fn type_key(&self) -> &str {
        &self.state.key
    }

    /// The last value broadcast.
    #[must_use]
    pub fn last(&self) -> Option<Value> {
        self.state.current()
    }

    /// Remember `value` and send it to every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize, MultiplexerError> {
        let data = serde_json::to_value(value)?;
        *self.state.last.lock() = Some(data);
        self.multiplexer.emit(self.state.as_ref())
    }
}

impl Drop for ManualBroadcaster {
    fn drop(&mut self) {
        self.multiplexer.unregister(&self.state.key);
    }
}

/// A manual broadcaster with a minimum interval between broadcasts.
///
/// Calls inside the interval are dropped, not deferred.
pub struct ThrottledBroadcaster {
    inner: ManualBroadcaster,
    interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl ThrottledBroadcaster {
    /// Register under `key` with the given interval.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateKey`] if `key` is taken.
    pub fn register(
        multiplexer: &Multiplexer,
        key: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, MultiplexerError> {
        Ok(Self {
            inner: ManualBroadcaster::register(multiplexer, key)?,
            interval,
            last_sent: Mutex::new(None),
        })
    }

    /// The stream key.
    #[must_use]
    pub fn type_key(&self) -> &str {
        self.inner.type_key()
    }

    /// Broadcast `value` unless the previous broadcast was too recent.
    ///
    /// Returns `None` when the call was dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Option<usize>, MultiplexerError> {
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(previous) = *last_sent {
                if now.duration_since(previous) < self.interval {
                    return Ok(None);
                }
            }
            *last_sent = Some(now);
        }

        self.inner.broadcast(value).map(Some)
    }
}
