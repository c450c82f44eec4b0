#![forbid(unsafe_code)]

pub use ruamq_macro::service;

mod error;
pub use error::{Error, ErrorKind, Result};

pub mod headers;
pub use headers::{FieldValue, HeaderPredicate, Headers, MatchMode};

mod codec;
pub use codec::{Codec, JsonCodec, MsgPackCodec};

mod pool;
pub use pool::{ObjectPool, Pooled, SLAB_SIZE};

mod delivery;
pub use delivery::{Acker, Delivery, DeliveryTag, Properties, QueuedMessage, WorkerResult};

mod broker;
pub use broker::{
    AmqpBroker, Broker, DeliveryStream, ExchangeKind, MemoryBroker, QueueOptions, Settlement,
    connect,
};

mod signature;
pub use signature::{CANONICAL_FORMAT_VERSION, QueueIdentity, Signature, SignatureRegistry, VOID};

mod waiter;
pub use waiter::{Receiver, ResponseHandler, Signal, Waiter};

mod config;
pub use config::{CONNECTION_ENV, DEFAULT_EXCHANGE, QueueConfig, UnroutablePolicy};

mod router;
pub use router::{Method, Route, Router};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod rpc;
pub use rpc::RpcRequest;

mod state;
pub use state::State;

mod client;
pub use client::QueueClient;
