use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Broker,
    error::{Error, ErrorKind, Result},
    headers::{self, Headers},
};

/// Outcome of a handler, deciding how its delivery is settled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerResult {
    /// Acknowledge.
    Success,
    /// Reject and requeue for another attempt.
    Requeue,
    /// Reject without requeue.
    Failed,
}

/// Broker-assigned delivery number, unique per channel.
pub type DeliveryTag = u64;

/// Message properties carried next to the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
}

/// A message handed to a consumer, awaiting settlement.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub queue: String,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Bytes,
}

impl Delivery {
    /// Number of earlier delivery attempts of this message.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.properties
            .headers
            .get(headers::X_DELIVERY_COUNT)
            .and_then(headers::FieldValue::as_int)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or_default()
    }

    /// Non-blank `target` header, naming a worker queue or a reply queue.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.properties
            .headers
            .get(headers::TARGET)
            .and_then(headers::FieldValue::as_str)
            .filter(|target| !target.trim().is_empty())
    }
}

/// Settlement handle of one delivery.
///
/// A delivery is settled exactly once. An `Acker` dropped without being
/// settled (including while unwinding from a panicking handler) rejects its
/// delivery with requeue.
pub struct Acker {
    broker: Arc<dyn Broker>,
    delivery_tag: DeliveryTag,
    finalized: AtomicBool,
}

impl Acker {
    /// Creates an unsettled handle for `delivery_tag` on `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, delivery_tag: DeliveryTag) -> Self {
        Self {
            broker,
            delivery_tag,
            finalized: AtomicBool::new(false),
        }
    }

    /// Tag of the delivery this handle settles.
    #[must_use]
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Settles the delivery according to `result`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyFinalized` if the delivery was settled before, or the
    /// broker error if the ack/reject itself fails.
    pub fn finish(&self, result: WorkerResult) -> Result<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::AlreadyFinalized,
                format!("delivery {} is already settled", self.delivery_tag),
            ));
        }
        match result {
            WorkerResult::Success => self.broker.ack(self.delivery_tag, false),
            WorkerResult::Requeue => self.broker.reject(self.delivery_tag, true),
            WorkerResult::Failed => self.broker.reject(self.delivery_tag, false),
        }
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        if !self.is_finalized() {
            tracing::warn!(
                "delivery {} left unsettled, requeueing",
                self.delivery_tag
            );
            if let Err(e) = self.finish(WorkerResult::Requeue) {
                tracing::error!("requeue of delivery {} failed: {e}", self.delivery_tag);
            }
        }
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.delivery_tag)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// A decoded worker message.
///
/// Returning a [`WorkerResult`] from the worker callback settles the message.
/// A callback may instead settle it explicitly with
/// [`acknowledge`](Self::acknowledge) or [`reject`](Self::reject); the
/// returned result is then ignored.
#[derive(Debug)]
pub struct QueuedMessage<T> {
    pub message: T,
    delivery: Delivery,
    acker: Arc<Acker>,
}

impl<T> QueuedMessage<T> {
    pub(crate) fn new(message: T, delivery: Delivery, acker: Arc<Acker>) -> Self {
        Self {
            message,
            delivery,
            acker,
        }
    }

    /// Raw delivery the message was decoded from.
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Whether the broker delivered this message before.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.acker.is_finalized()
    }

    /// # Errors
    ///
    /// Returns `AlreadyFinalized` if the message was settled before.
    pub fn acknowledge(&self) -> Result<()> {
        self.acker.finish(WorkerResult::Success)
    }

    /// # Errors
    ///
    /// Returns `AlreadyFinalized` if the message was settled before.
    pub fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.finish(if requeue {
            WorkerResult::Requeue
        } else {
            WorkerResult::Failed
        })
    }

    /// Unwraps the message. The delivery is still settled from the handler
    /// result, or requeued if that never happens.
    pub fn into_inner(self) -> T {
        self.message
    }
}

impl<T> std::ops::Deref for QueuedMessage<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBroker, QueueOptions, Settlement};

    fn broker_with_delivery() -> (Arc<MemoryBroker>, Delivery) {
        let broker = Arc::new(MemoryBroker::with_ledger());
        broker.declare_queue("jobs", QueueOptions::durable()).unwrap();
        let mut stream = broker.consume("jobs", 0).unwrap();
        broker
            .publish("", "jobs", Properties::default(), Bytes::from_static(b"{}"))
            .unwrap();
        let delivery = stream.try_recv().unwrap();
        (broker, delivery)
    }

    #[test]
    fn test_settles_exactly_once() {
        let (broker, delivery) = broker_with_delivery();
        let acker = Arc::new(Acker::new(broker.clone(), delivery.delivery_tag));
        let msg = QueuedMessage::new(7u32, delivery.clone(), acker.clone());
        assert_eq!(*msg, 7);

        msg.reject(false).unwrap();
        assert!(msg.is_finalized());
        assert_eq!(msg.acknowledge().unwrap_err().kind, ErrorKind::AlreadyFinalized);
        assert_eq!(
            acker.finish(WorkerResult::Success).unwrap_err().kind,
            ErrorKind::AlreadyFinalized
        );

        drop(msg);
        drop(acker);
        assert_eq!(
            broker.settlements(),
            vec![Settlement::Reject {
                delivery_tag: delivery.delivery_tag,
                queue: "jobs".into(),
                requeue: false,
            }]
        );
    }

    #[test]
    fn test_unsettled_drop_requeues() {
        let (broker, delivery) = broker_with_delivery();
        drop(Acker::new(broker.clone(), delivery.delivery_tag));
        assert_eq!(
            broker.settlements(),
            vec![Settlement::Reject {
                delivery_tag: delivery.delivery_tag,
                queue: "jobs".into(),
                requeue: true,
            }]
        );
        assert_eq!(broker.message_count("jobs"), 1);
    }

    #[test]
    fn test_delivery_metadata() {
        let (_broker, mut delivery) = broker_with_delivery();
        assert_eq!(delivery.delivery_count(), 0);
        assert_eq!(delivery.target(), None);

        let props = &mut delivery.properties;
        props.headers.insert(headers::X_DELIVERY_COUNT.into(), 3i64.into());
        props.headers.insert(headers::TARGET.into(), "  ".into());
        assert_eq!(delivery.delivery_count(), 3);
        assert_eq!(delivery.target(), None);
    }
}
