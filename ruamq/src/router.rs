use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;

use crate::{
    Acker, Delivery, QueueIdentity, Signature, WorkerResult,
    waiter::{ResponseHandler, Waiter},
};

/// A worker callback or RPC handler, run with the delivery it was given.
pub type Method = Arc<dyn Fn(Delivery, Arc<Acker>) -> WorkerResult + Send + Sync>;

/// Where a delivery goes.
pub enum Route {
    /// Response to a pending call of this process.
    Response(ResponseHandler),
    /// Delivery on the private reply queue whose call is no longer pending.
    LateReply,
    /// Worker registered for the `target` header.
    Worker(Method),
    /// Handler bound for the signature headers.
    Rpc(Method),
    /// Nothing in this process takes the delivery.
    Unroutable,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Route::Response(_) => "Response",
            Route::LateReply => "LateReply",
            Route::Worker(_) => "Worker",
            Route::Rpc(_) => "Rpc",
            Route::Unroutable => "Unroutable",
        })
    }
}

/// Worker and RPC handler tables.
#[derive(Default)]
pub struct Router {
    workers: DashMap<String, Method, RandomState>,
    handlers: DashMap<QueueIdentity, Method, RandomState>,
}

impl Router {
    /// Registers a worker unless one with the same name exists.
    ///
    /// # Returns
    ///
    /// `true` if `method` was registered, `false` if the name was taken.
    pub fn add_worker(&self, name: &str, method: Method) -> bool {
        match self.workers.entry(name.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(method);
                true
            }
        }
    }

    pub(crate) fn remove_worker(&self, name: &str) {
        self.workers.remove(name);
    }

    /// Whether a worker named `name` is registered.
    #[must_use]
    pub fn has_worker(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Registers an RPC handler unless the identity is already bound.
    ///
    /// # Returns
    ///
    /// `true` if `method` was registered, `false` if the identity was bound.
    pub fn add_handler(&self, identity: QueueIdentity, method: Method) -> bool {
        match self.handlers.entry(identity) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(method);
                true
            }
        }
    }

    pub(crate) fn remove_handler(&self, identity: &QueueIdentity) {
        self.handlers.remove(identity);
    }

    /// Names of all registered workers, in no particular order.
    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// Classifies a delivery.
    ///
    /// Deliveries on `reply_queue` are always responses: either to a pending
    /// call, whose entry is removed here, or late ones. Anything else goes to
    /// the worker named by its `target` header, then to the handler bound for
    /// its signature headers.
    pub fn route(&self, delivery: &Delivery, waiter: &Waiter, reply_queue: &str) -> Route {
        if delivery.queue == reply_queue {
            return match delivery
                .properties
                .correlation_id
                .as_deref()
                .and_then(|id| waiter.take(id))
            {
                Some(handler) => Route::Response(handler),
                None => Route::LateReply,
            };
        }

        if let Some(method) = delivery
            .target()
            .and_then(|target| self.workers.get(target))
        {
            return Route::Worker(method.clone());
        }

        if let Some(method) = Signature::from_headers(&delivery.properties.headers)
            .and_then(|signature| self.handlers.get(&signature.identity()))
        {
            return Route::Rpc(method.clone());
        }

        Route::Unroutable
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("workers", &self.worker_names())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
