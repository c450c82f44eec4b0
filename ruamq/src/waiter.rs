use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    WorkerResult,
    error::{Error, ErrorKind, Result},
    pool::{ObjectPool, Pooled},
};

/// Called by the router with the raw body of a correlated response.
pub type ResponseHandler = Box<dyn FnOnce(Bytes) -> WorkerResult + Send + Sync>;

#[derive(Default)]
struct SignalState {
    correlation_id: Option<String>,
    value: Option<Bytes>,
}

/// Reusable wake-up primitive with a single released-value slot.
///
/// A signal is armed with the correlation id of the call that owns it. Values
/// posted for any other id are refused, so a response racing with a timeout
/// can never leak into the next call that reuses the same pooled signal.
#[derive(Default)]
pub struct Signal {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl Signal {
    fn arm(&self, correlation_id: &str) {
        let mut state = self.state.lock();
        state.correlation_id = Some(correlation_id.to_owned());
        state.value = None;
    }

    /// Stores `value` and wakes the waiter if the signal is armed for
    /// `correlation_id`.
    pub fn set(&self, correlation_id: &str, value: Bytes) -> bool {
        {
            let mut state = self.state.lock();
            if state.correlation_id.as_deref() != Some(correlation_id) || state.value.is_some() {
                return false;
            }
            state.value = Some(value);
        }
        self.notify.notify_one();
        true
    }

    async fn wait(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            let value = self.state.lock().value.take();
            if let Some(value) = value {
                return value;
            }
            // a permit left behind by a previous owner wakes us spuriously.
            notified.await;
        }
    }
}

/// Pending-call table correlating RPC requests with their responses.
///
/// Entries are created right before a request is published and removed when
/// the response arrives, when the call times out, or when the caller goes
/// away, whichever comes first.
pub struct Waiter {
    pending: DashMap<String, ResponseHandler, RandomState>,
    signals: Arc<ObjectPool<Signal>>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self {
            pending: DashMap::default(),
            signals: ObjectPool::new(Signal::default),
        }
    }
}

/// RAII guard removing a pending entry when the call finishes in any way.
pub struct WaiterCleaner<'a> {
    waiter: &'a Waiter,
    correlation_id: String,
}

impl Drop for WaiterCleaner<'_> {
    fn drop(&mut self) {
        self.waiter.remove(&self.correlation_id);
    }
}

/// The caller's side of a pending call.
pub struct Receiver<'a> {
    // dropped first: the entry must leave the table before the signal goes
    // back to the pool.
    cleaner: WaiterCleaner<'a>,
    signal: Pooled<Signal>,
}

impl Receiver<'_> {
    /// Correlation id the response must carry.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.cleaner.correlation_id
    }

    /// Waits for the response body.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrives within `timeout`; the pending
    /// entry is removed either way.
    pub async fn recv(self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.signal.wait()).await {
            Ok(value) => Ok(value),
            Err(_) => Err(Error::new(
                ErrorKind::Timeout,
                format!(
                    "no response for {} within {timeout:?}",
                    self.correlation_id()
                ),
            )),
        }
    }
}

impl Waiter {
    /// Registers a new pending call under a fresh correlation id.
    pub fn alloc(&self) -> Receiver<'_> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let signal = self.signals.acquire();
        signal.arm(&correlation_id);

        let handle = signal.handle();
        let id = correlation_id.clone();
        let handler: ResponseHandler = Box::new(move |body| {
            if !handle.set(&id, body) {
                tracing::warn!("response for {id} arrived after its caller gave up");
            }
            WorkerResult::Success
        });
        self.pending.insert(correlation_id.clone(), handler);

        Receiver {
            cleaner: WaiterCleaner {
                waiter: self,
                correlation_id,
            },
            signal,
        }
    }

    /// Removes and returns the response handler registered for
    /// `correlation_id`.
    pub fn take(&self, correlation_id: &str) -> Option<ResponseHandler> {
        self.pending
            .remove(correlation_id)
            .map(|(_, handler)| handler)
    }

    /// Whether a call with `correlation_id` is pending.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn remove(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.pending.len())
            .field("signals", &self.signals)
            .finish()
    }
}
