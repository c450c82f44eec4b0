use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::DropGuard;

use crate::{
    Acker, Broker, Codec, Delivery, ExchangeKind, HeaderPredicate, Method, MsgPackCodec,
    Properties, QueueConfig, QueueIdentity, QueueOptions, QueuedMessage, Result, RpcRequest,
    Signature, State, WorkerResult,
    error::{Error, ErrorKind},
    headers::{self, Headers},
};

/// Work-queue and RPC endpoint on a headers exchange.
///
/// # Examples
///
/// ```rust,no_run
/// # use ruamq::{QueueClient, QueueConfig, Signature};
/// # #[tokio::main]
/// # async fn main() -> ruamq::Result<()> {
/// let client = QueueClient::<ruamq::MsgPackCodec>::connect(QueueConfig::default())?;
/// let add = Signature::new("String", "Calculator.add", ["i32", "i32"]);
/// client.bind(&add, |(a, b): (i32, i32)| (a + b).to_string())?;
///
/// let sum: String = client.call(&add, (2, 3)).await?;
/// assert_eq!(sum, "5");
/// # Ok(())
/// # }
/// ```
pub struct QueueClient<C: Codec = MsgPackCodec> {
    state: Arc<State>,
    codec: C,
    _drop_guard: DropGuard,
}

impl<C: Codec + Default> QueueClient<C> {
    /// Connects to the broker named by `config.connection_string`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or the exchange
    /// and reply queue cannot be declared.
    pub fn connect(config: QueueConfig) -> Result<Self> {
        let broker = crate::connect(&config.connection_string)?;
        Self::new(broker, config, C::default())
    }
}

impl<C: Codec> QueueClient<C> {
    /// Declares the shared exchange and the private reply queue, and starts
    /// consuming replies. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the broker error if any declaration fails.
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig, codec: C) -> Result<Self> {
        broker.declare_exchange(&config.exchange, ExchangeKind::Headers, true)?;
        let state = Arc::new(State::create(config, broker));
        let client = Self {
            _drop_guard: state.supervisor.drop_guard(),
            state,
            codec,
        };

        let reply_queue = &client.state.reply_queue;
        client
            .state
            .broker
            .declare_queue(reply_queue, QueueOptions::exclusive())?;
        client.state.broker.bind_queue(
            reply_queue,
            &client.state.config.exchange,
            &HeaderPredicate::target(reply_queue),
        )?;
        client.start_consuming(reply_queue)?;
        tracing::debug!("client ready, replies on {reply_queue} ({})", C::NAME);
        Ok(client)
    }

    /// Shared state behind this client and its consume loops.
    #[must_use]
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Configuration the client was created with.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.state.config
    }

    /// Codec used for message bodies.
    #[must_use]
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Number of calls currently waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.waiter.len()
    }

    /// Declares the queue of `signature` on the broker.
    ///
    /// # Returns
    ///
    /// The queue identity, which is also the queue name.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the declaration fails.
    pub fn declare(&self, signature: &Signature) -> Result<QueueIdentity> {
        self.state.registry.declare(signature)
    }

    /// Sends a one-way message to the worker queue `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or published.
    pub fn publish<T: Serialize + ?Sized>(&self, target: &str, message: &T) -> Result<()> {
        let body = self.codec.serialize(message)?;
        let properties = Properties {
            headers: Headers::from([(headers::TARGET.to_owned(), target.into())]),
            ..Default::default()
        };
        self.state
            .broker
            .publish(&self.state.config.exchange, "", properties, body)
    }

    /// Registers `callback` as the worker for queue `name`.
    ///
    /// Returns `Ok(false)` without changing anything if a worker with this
    /// name is already registered. Otherwise declares the durable queue,
    /// binds it on `target = name` and starts consuming.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the queue cannot be declared or consumed.
    pub fn register_worker<T, F>(&self, name: &str, callback: F) -> Result<bool>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(QueuedMessage<T>) -> WorkerResult + Send + Sync + 'static,
    {
        if self.state.router.has_worker(name) {
            return Ok(false);
        }

        let codec = self.codec.clone();
        let decode_failure = self.state.config.decode_failure;
        let method: Method = Arc::new(move |delivery: Delivery, acker: Arc<Acker>| {
            match codec.deserialize::<T>(&delivery.body) {
                Ok(message) => callback(QueuedMessage::new(message, delivery, acker)),
                Err(e) => {
                    tracing::warn!(
                        "undecodable message {} on {}: {e}",
                        delivery.delivery_tag,
                        delivery.queue
                    );
                    decode_failure
                }
            }
        });
        if !self.state.router.add_worker(name, method) {
            return Ok(false);
        }

        let started = self
            .state
            .broker
            .declare_queue(name, QueueOptions::durable())
            .and_then(|()| {
                self.state.broker.bind_queue(
                    name,
                    &self.state.config.exchange,
                    &HeaderPredicate::target(name),
                )
            })
            .and_then(|()| self.start_consuming(name));
        if let Err(e) = started {
            self.state.router.remove_worker(name);
            return Err(e);
        }
        tracing::info!("worker {name} registered");
        Ok(true)
    }

    /// Serves `signature` with `implementation`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateBinding` if the signature is already bound in this
    /// process, or the broker error if the queue cannot be declared or
    /// consumed.
    pub fn bind<A, R, F>(&self, signature: &Signature, implementation: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let identity = self.state.registry.declare(signature)?;

        let codec = self.codec.clone();
        let broker = self.state.broker.clone();
        let exchange = self.state.config.exchange.clone();
        let decode_failure = self.state.config.decode_failure;
        let is_void = signature.is_void();
        let name = signature.name.clone();
        let method: Method = Arc::new(move |delivery: Delivery, _acker: Arc<Acker>| {
            let request: RpcRequest<A> = match codec.deserialize(&delivery.body) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("undecodable request for {name}: {e}");
                    return decode_failure;
                }
            };
            let result = implementation(request.arguments);
            if is_void {
                return WorkerResult::Success;
            }

            let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
                tracing::warn!("request for {name} has no reply-to");
                return WorkerResult::Failed;
            };
            let body = match codec.serialize(&result) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("unencodable result of {name}: {e}");
                    return decode_failure;
                }
            };
            let properties = Properties {
                correlation_id: delivery.properties.correlation_id.clone(),
                reply_to: None,
                headers: Headers::from([(headers::TARGET.to_owned(), reply_to.into())]),
            };
            match broker.publish(&exchange, "", properties, body) {
                Ok(()) => WorkerResult::Success,
                Err(e) => {
                    tracing::warn!("reply of {name} to {reply_to} failed: {e}");
                    WorkerResult::Requeue
                }
            }
        });

        if !self.state.router.add_handler(identity.clone(), method) {
            return Err(Error::new(
                ErrorKind::DuplicateBinding,
                format!("`{signature}` is already bound"),
            ));
        }
        if let Err(e) = self.start_consuming(identity.as_str()) {
            self.state.router.remove_handler(&identity);
            return Err(e);
        }
        tracing::info!("bound `{signature}` on {identity}");
        Ok(())
    }

    /// Calls the remote method `signature` with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call<A, R>(&self, signature: &Signature, arguments: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(signature, arguments, self.state.config.rpc_timeout)
            .await
    }

    /// Calls the remote method `signature`.
    ///
    /// A void signature is published without a reply-to and returns at once
    /// with `R` decoded from an empty payload. Dropping the returned future
    /// abandons the call.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrives within `timeout`, or an
    /// error if the request cannot be published or the response decoded.
    pub async fn call_with_timeout<A, R>(
        &self,
        signature: &Signature,
        arguments: A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.state.registry.declare(signature)?;
        let body = self.codec.serialize(&RpcRequest { arguments })?;
        let mut properties = Properties {
            headers: signature.headers(),
            ..Default::default()
        };

        if signature.is_void() {
            properties.correlation_id = Some(uuid::Uuid::new_v4().to_string());
            self.state
                .broker
                .publish(&self.state.config.exchange, "", properties, body)?;
            return self.codec.deserialize(&[]);
        }

        let receiver = self.state.waiter.alloc();
        properties.correlation_id = Some(receiver.correlation_id().to_owned());
        properties.reply_to = Some(self.state.reply_queue.clone());
        self.state
            .broker
            .publish(&self.state.config.exchange, "", properties, body)?;
        tracing::debug!("called `{signature}` as {}", receiver.correlation_id());

        let response = receiver.recv(timeout).await?;
        self.codec.deserialize(&response)
    }

    /// Stops all consume loops and cancels their consumers.
    ///
    /// Deliveries already handed to handlers stay unsettled until their
    /// handler finishes and settles them. Deliveries the broker pushed but no
    /// loop received yet go back to their queue.
    pub fn stop(&self) {
        self.state.supervisor.stop();
    }

    /// Waits until consume loops and in-flight handlers have finished. Call
    /// after [`stop`](Self::stop).
    pub async fn join(&self) {
        self.state.supervisor.all_stopped().await;
    }

    fn start_consuming(&self, queue: &str) -> Result<()> {
        let mut stream = self
            .state
            .broker
            .consume(queue, self.state.config.prefetch)?;
        let state = self.state.clone();
        let queue = queue.to_owned();
        self.state.supervisor.spawn(|guard| async move {
            loop {
                tokio::select! {
                    biased;
                    () = guard.stopped() => break,
                    delivery = stream.recv() => match delivery {
                        Some(delivery) => state.handle_delivery(delivery),
                        None => break,
                    },
                }
            }
            // cancel the consumer before the guard reports this task done.
            drop(stream);
            tracing::debug!("consumer on {queue} stopped");
        });
        Ok(())
    }
}

impl<C: Codec> std::fmt::Debug for QueueClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("codec", &C::NAME)
            .field("state", &self.state)
            .finish()
    }
}
