use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use crate::{
    Acker, Broker, Delivery, QueueConfig, Route, Router, SignatureRegistry, TaskSupervisor,
    Waiter, WorkerResult,
};

/// Shared state behind a [`QueueClient`](crate::QueueClient) and its consume
/// loops.
pub struct State {
    pub config: QueueConfig,
    pub broker: Arc<dyn Broker>,
    pub router: Router,
    pub waiter: Waiter,
    pub registry: SignatureRegistry,
    pub reply_queue: String,
    pub(crate) supervisor: TaskSupervisor,
}

impl State {
    pub(crate) fn create(config: QueueConfig, broker: Arc<dyn Broker>) -> Self {
        let registry = SignatureRegistry::new(broker.clone(), config.exchange.clone());
        Self {
            reply_queue: format!("{}.reply.{}", config.exchange, uuid::Uuid::new_v4()),
            config,
            broker,
            router: Router::default(),
            waiter: Waiter::default(),
            registry,
            supervisor: TaskSupervisor::create(),
        }
    }

    /// Single entry point for every delivery this process consumes.
    ///
    /// Never blocks: worker and RPC handlers are moved to the blocking pool.
    /// Every delivery is settled exactly once, by its handler or here.
    pub fn handle_delivery(self: &Arc<Self>, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let acker = Arc::new(Acker::new(self.broker.clone(), tag));

        match self.router.route(&delivery, &self.waiter, &self.reply_queue) {
            Route::Response(handler) => {
                tracing::debug!("delivery {tag} is a response");
                let result = match catch_unwind(AssertUnwindSafe(|| handler(delivery.body))) {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!("response handler of delivery {tag} panicked");
                        WorkerResult::Requeue
                    }
                };
                settle(&acker, result);
            }
            Route::LateReply => {
                tracing::warn!(
                    "discarding late reply {:?} on {}",
                    delivery.properties.correlation_id,
                    delivery.queue
                );
                settle(&acker, WorkerResult::Failed);
            }
            Route::Worker(method) | Route::Rpc(method) => {
                tracing::debug!("delivery {tag} on {} dispatched to handler", delivery.queue);
                self.supervisor.spawn_blocking(move || {
                    let result =
                        match catch_unwind(AssertUnwindSafe(|| method(delivery, acker.clone()))) {
                            Ok(result) => result,
                            Err(_) => {
                                tracing::error!("handler of delivery {tag} panicked, requeueing");
                                WorkerResult::Requeue
                            }
                        };
                    settle(&acker, result);
                });
            }
            Route::Unroutable => {
                let result = self.config.unroutable.resolve(delivery.delivery_count());
                tracing::warn!(
                    "delivery {tag} on {} matches no handler: {result:?}",
                    delivery.queue
                );
                settle(&acker, result);
            }
        }
    }
}

fn settle(acker: &Acker, result: WorkerResult) {
    if acker.is_finalized() {
        return;
    }
    if let Err(e) = acker.finish(result) {
        tracing::error!(
            "settling delivery {} as {result:?} failed: {e}",
            acker.delivery_tag()
        );
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("waiter", &self.waiter)
            .field("reply_queue", &self.reply_queue)
            .finish_non_exhaustive()
    }
}
