use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, DeliveryStream, ExchangeKind, QueueOptions};
use crate::{
    Delivery, DeliveryTag, HeaderPredicate, Properties,
    error::{Error, ErrorKind, Result},
    headers,
};

/// A settlement recorded by [`MemoryBroker`], in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack {
        delivery_tag: DeliveryTag,
        queue: String,
    },
    Reject {
        delivery_tag: DeliveryTag,
        queue: String,
        requeue: bool,
    },
}

impl Settlement {
    #[must_use]
    pub fn queue(&self) -> &str {
        match self {
            Settlement::Ack { queue, .. } | Settlement::Reject { queue, .. } => queue,
        }
    }
}

#[derive(Clone)]
struct Message {
    properties: Properties,
    body: Bytes,
    redelivered: bool,
    delivery_count: u32,
}

impl Message {
    fn to_delivery(&self, delivery_tag: DeliveryTag, queue: &str) -> Delivery {
        let mut properties = self.properties.clone();
        if self.delivery_count > 0 {
            properties.headers.insert(
                headers::X_DELIVERY_COUNT.to_owned(),
                i64::from(self.delivery_count).into(),
            );
        }
        Delivery {
            delivery_tag,
            queue: queue.to_owned(),
            redelivered: self.redelivered,
            properties,
            body: self.body.clone(),
        }
    }
}

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: u16,
    in_flight: usize,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Queue {
    options: QueueOptions,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
    had_consumer: bool,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: vec![],
            cursor: 0,
            had_consumer: false,
        }
    }

    /// Round-robin over consumers that still have prefetch capacity.
    fn next_consumer(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        let index = (0..len)
            .map(|offset| (self.cursor + offset) % len)
            .find(|&index| self.consumers[index].has_capacity())?;
        self.cursor = index + 1;
        Some(index)
    }
}

struct Binding {
    queue: String,
    predicate: HeaderPredicate,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

struct Unacked {
    queue: String,
    consumer_id: u64,
    message: Message,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, Exchange, RandomState>,
    queues: HashMap<String, Queue, RandomState>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    last_tag: DeliveryTag,
    last_consumer_id: u64,
    settlements: Option<Vec<Settlement>>,
}

impl Inner {
    fn enqueue(&mut self, queue: &str, message: Message) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
            self.pump(queue);
        }
    }

    fn pump(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        queue.consumers.retain(|consumer| !consumer.tx.is_closed());
        loop {
            if queue.ready.is_empty() {
                break;
            }
            let Some(index) = queue.next_consumer() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            self.last_tag += 1;
            let tag = self.last_tag;
            let consumer = &mut queue.consumers[index];
            if consumer.tx.send(message.to_delivery(tag, name)).is_err() {
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            consumer.in_flight += 1;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_owned(),
                    consumer_id: consumer.id,
                    message,
                },
            );
        }

        if queue.options.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
            tracing::debug!("auto-deleting queue {name}");
            self.queues.remove(name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|binding| binding.queue != name);
            }
        }
    }

    /// Removes a consumer. Deliveries it never received go back to the head
    /// of the queue; received ones stay unacked until settled.
    fn cancel(&mut self, name: &str, consumer_id: u64, unreceived: &[Delivery]) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        queue.consumers.retain(|consumer| consumer.id != consumer_id);
        for delivery in unreceived.iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&delivery.delivery_tag) {
                unacked.message.redelivered = true;
                queue.ready.push_front(unacked.message);
            }
        }
        tracing::debug!(
            "consumer {consumer_id} on {name} cancelled, {} returned",
            unreceived.len()
        );
        self.pump(name);
    }

    fn settle(&mut self, delivery_tag: DeliveryTag, requeue: Option<bool>) -> Result<()> {
        let Some(mut unacked) = self.unacked.remove(&delivery_tag) else {
            return Err(Error::new(
                ErrorKind::DeliveryNotFound,
                format!("unknown delivery tag {delivery_tag}"),
            ));
        };
        let queue_name = unacked.queue.clone();
        if let Some(ledger) = &mut self.settlements {
            ledger.push(match requeue {
                None => Settlement::Ack {
                    delivery_tag,
                    queue: queue_name.clone(),
                },
                Some(requeue) => Settlement::Reject {
                    delivery_tag,
                    queue: queue_name.clone(),
                    requeue,
                },
            });
        }

        let Some(queue) = self.queues.get_mut(&queue_name) else {
            return Ok(());
        };
        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|consumer| consumer.id == unacked.consumer_id)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        if requeue == Some(true) {
            unacked.message.redelivered = true;
            unacked.message.delivery_count += 1;
            queue.ready.push_front(unacked.message);
        }
        self.pump(&queue_name);
        Ok(())
    }
}

/// In-process broker with AMQP headers-exchange semantics.
///
/// Every consumer is manual-ack. Requeued messages go back to the head of
/// their queue flagged as redelivered and carry an incremented
/// `x-delivery-count` header. A broker built with
/// [`with_ledger`](Self::with_ledger) also records every ack and reject.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    /// Creates a broker recording every settlement, for inspection with
    /// [`settlements`](Self::settlements). The ledger is never trimmed.
    #[must_use]
    pub fn with_ledger() -> Self {
        let broker = Self::default();
        broker.inner.lock().settlements = Some(vec![]);
        broker
    }

    /// Acks and rejects seen so far, in call order.
    ///
    /// # Returns
    ///
    /// The recorded settlements, or an empty list if the broker keeps no
    /// ledger.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.lock().settlements.clone().unwrap_or_default()
    }

    /// Number of messages ready for delivery in `queue`.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of live consumers on `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    /// Number of delivered but unsettled messages across all queues.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    /// Whether `queue` is declared and not yet auto-deleted.
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    /// Number of queue bindings on `exchange`.
    #[must_use]
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.inner
            .lock()
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }
}

impl Broker for MemoryBroker {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(exchange) = inner.exchanges.get(name) {
            if exchange.kind != kind || exchange.durable != durable {
                return Err(Error::new(
                    ErrorKind::PreconditionFailed,
                    format!("exchange {name} exists with different options"),
                ));
            }
            return Ok(());
        }
        inner.exchanges.insert(
            name.to_owned(),
            Exchange {
                kind,
                durable,
                bindings: vec![],
            },
        );
        Ok(())
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.get(name) {
            if queue.options != options {
                return Err(Error::new(
                    ErrorKind::PreconditionFailed,
                    format!("queue {name} exists with different options"),
                ));
            }
            return Ok(());
        }
        inner.queues.insert(name.to_owned(), Queue::new(options));
        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, predicate: &HeaderPredicate) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.queues.contains_key(queue) {
            return Err(Error::new(ErrorKind::QueueNotFound, queue.to_owned()));
        }
        let Some(exchange) = inner.exchanges.get_mut(exchange) else {
            return Err(Error::new(ErrorKind::ExchangeNotFound, exchange.to_owned()));
        };
        let exists = exchange
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.predicate == *predicate);
        if !exists {
            exchange.bindings.push(Binding {
                queue: queue.to_owned(),
                predicate: predicate.clone(),
            });
        }
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let Some(ex) = inner.exchanges.get(exchange) else {
                return Err(Error::new(ErrorKind::ExchangeNotFound, exchange.to_owned()));
            };
            let mut targets: Vec<String> = vec![];
            for binding in &ex.bindings {
                let matched = match ex.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Headers => binding.predicate.matches(&properties.headers),
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            tracing::debug!("message published to {exchange:?} matched no queue, dropped");
        }
        let message = Message {
            properties,
            body,
            redelivered: false,
            delivery_count: 0,
        };
        for queue in targets {
            inner.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        let mut inner = self.inner.lock();
        inner.last_consumer_id += 1;
        let id = inner.last_consumer_id;
        let Some(q) = inner.queues.get_mut(queue) else {
            return Err(Error::new(ErrorKind::QueueNotFound, queue.to_owned()));
        };
        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(Consumer {
            id,
            tx,
            prefetch,
            in_flight: 0,
        });
        q.had_consumer = true;
        inner.pump(queue);

        let shared = self.inner.clone();
        let queue = queue.to_owned();
        Ok(DeliveryStream::new(rx, move |unreceived| {
            shared.lock().cancel(&queue, id, &unreceived);
        }))
    }

    fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !multiple {
            return inner.settle(delivery_tag, None);
        }
        let tags: Vec<_> = inner.unacked.range(..=delivery_tag).map(|(t, _)| *t).collect();
        if tags.is_empty() {
            return Err(Error::new(
                ErrorKind::DeliveryNotFound,
                format!("no unsettled delivery up to tag {delivery_tag}"),
            ));
        }
        for tag in tags {
            inner.settle(tag, None)?;
        }
        Ok(())
    }

    fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.inner.lock().settle(delivery_tag, Some(requeue))
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &inner.exchanges.len())
            .field("queues", &inner.queues.len())
            .field("unacked", &inner.unacked.len())
            .finish()
    }
}
