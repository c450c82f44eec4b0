use std::future::Future;

use bytes::Bytes;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use tokio::{runtime::RuntimeFlavor, sync::mpsc};

use super::{Broker, DeliveryStream, ExchangeKind, QueueOptions};
use crate::{
    Delivery, DeliveryTag, FieldValue, HeaderPredicate, Headers, Properties,
    error::{Error, ErrorKind, Result},
};

impl From<lapin::Error> for Error {
    fn from(value: lapin::Error) -> Self {
        Self {
            kind: ErrorKind::BrokerError,
            msg: value.to_string(),
        }
    }
}

/// Runs a lapin future to completion from synchronous code.
///
/// Works on tokio worker threads and on the blocking pool alike, as long as
/// the runtime is multi-threaded.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let handle = tokio::runtime::Handle::try_current().map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("amqp transport needs a tokio runtime: {e}"),
        )
    })?;
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "amqp transport needs a multi-threaded tokio runtime".into(),
        ));
    }
    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(v) => AMQPValue::Boolean(*v),
        FieldValue::Int(v) => AMQPValue::LongLongInt(*v),
        FieldValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        FieldValue::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
    }
}

/// Converts a wire value back. Values without a [`FieldValue`] counterpart,
/// such as floats or nested tables, are dropped.
fn from_amqp_value(value: &AMQPValue) -> Option<FieldValue> {
    let value = match value {
        AMQPValue::Boolean(v) => FieldValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => FieldValue::Int(*v),
        AMQPValue::ShortString(v) => FieldValue::Str(v.as_str().to_owned()),
        AMQPValue::LongString(v) => {
            FieldValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => FieldValue::Array(
            items
                .as_slice()
                .iter()
                .filter_map(from_amqp_value)
                .collect(),
        ),
        _ => return None,
    };
    Some(value)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| Some((key.as_str().to_owned(), from_amqp_value(value)?)))
        .collect()
}

fn to_basic_properties(properties: &Properties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(to_field_table(&properties.headers));
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> Properties {
    Properties {
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        reply_to: basic.reply_to().as_ref().map(|to| to.as_str().to_owned()),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn to_delivery(delivery: lapin::message::Delivery, queue: &str) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        queue: queue.to_owned(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: Bytes::from(delivery.data),
    }
}

/// Broker backed by an AMQP 0-9-1 connection, e.g. RabbitMQ.
///
/// All primitives share one channel, so delivery tags from every consumer
/// can be settled through [`Broker::ack`] and [`Broker::reject`]. The
/// prefetch of a consumer maps to a per-consumer `basic.qos`. RabbitMQ only
/// sets `x-delivery-count` on quorum queues; elsewhere the count reads as 0.
pub struct AmqpBroker {
    _connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Connects to `uri` (`amqp://` or `amqps://`) and opens the channel.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the broker cannot be reached, or
    /// `InvalidArgument` outside a multi-threaded tokio runtime.
    pub fn connect(uri: &str) -> Result<Self> {
        let opened = block_on(async {
            let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;
            Ok::<_, lapin::Error>((connection, channel))
        })?;
        let (connection, channel) = opened
            .map_err(|e| Error::new(ErrorKind::ConnectionFailed, format!("{uri}: {e}")))?;
        tracing::info!("connected to amqp broker, channel {}", channel.id());
        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

impl Broker for AmqpBroker {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        block_on(
            self.channel
                .exchange_declare(name, kind, options, FieldTable::default()),
        )??;
        Ok(())
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };
        block_on(
            self.channel
                .queue_declare(name, options, FieldTable::default()),
        )??;
        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, predicate: &HeaderPredicate) -> Result<()> {
        let arguments = to_field_table(&predicate.to_arguments());
        block_on(self.channel.queue_bind(
            queue,
            exchange,
            "",
            QueueBindOptions::default(),
            arguments,
        ))??;
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> Result<()> {
        let properties = to_basic_properties(&properties);
        block_on(async {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await?
                .await
        })?
        .map_err(|e| Error::new(ErrorKind::PublishFailed, e.to_string()))?;
        Ok(())
    }

    fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        let consumer_tag = format!("ruamq-{}", uuid::Uuid::new_v4());
        let mut consumer = block_on(async {
            self.channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await?;
            self.channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
        })?
        .map_err(|e| Error::new(ErrorKind::ConsumeFailed, format!("{queue}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        let name = queue.to_owned();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let tag = delivery.delivery_tag;
                        if tx.send(to_delivery(delivery, &name)).is_err() {
                            // cancelled: hand back what arrives before cancel-ok.
                            let requeue = BasicRejectOptions { requeue: true };
                            if let Err(e) = channel.basic_reject(tag, requeue).await {
                                tracing::warn!("returning delivery {tag} on {name} failed: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("consumer on {name} failed: {e}");
                        break;
                    }
                }
            }
            tracing::debug!("amqp consumer on {name} finished");
        });

        let channel = self.channel.clone();
        Ok(DeliveryStream::new(rx, move |unreceived| {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::warn!("consumer {consumer_tag} dropped outside a runtime");
                return;
            };
            handle.spawn(async move {
                if let Err(e) = channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await
                {
                    tracing::warn!("cancelling consumer {consumer_tag} failed: {e}");
                }
                for delivery in unreceived {
                    let requeue = BasicRejectOptions { requeue: true };
                    if let Err(e) = channel.basic_reject(delivery.delivery_tag, requeue).await {
                        tracing::warn!(
                            "returning delivery {} failed: {e}",
                            delivery.delivery_tag
                        );
                    }
                }
            });
        }))
    }

    fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        block_on(
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions { multiple }),
        )??;
        Ok(())
    }

    fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        block_on(
            self.channel
                .basic_reject(delivery_tag, BasicRejectOptions { requeue }),
        )??;
        Ok(())
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("channel", &self.channel.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;

    #[test]
    fn test_header_conversion() {
        let original = Headers::from([
            (headers::TARGET.to_owned(), "INGEST".into()),
            (headers::ARGS.to_owned(), vec!["i32".to_owned(), "i32".to_owned()].into()),
            ("flag".to_owned(), true.into()),
            ("count".to_owned(), 3i64.into()),
        ]);
        assert_eq!(from_field_table(&to_field_table(&original)), original);

        let mut table = FieldTable::default();
        table.insert(headers::X_DELIVERY_COUNT.into(), AMQPValue::LongInt(2));
        table.insert("ratio".into(), AMQPValue::Double(0.5));
        let converted = from_field_table(&table);
        assert_eq!(
            converted.get(headers::X_DELIVERY_COUNT),
            Some(&FieldValue::Int(2))
        );
        assert!(!converted.contains_key("ratio"));
    }

    #[test]
    fn test_properties_conversion() {
        let properties = Properties {
            correlation_id: Some("c-1".into()),
            reply_to: Some("ruamq.reply.x".into()),
            headers: Headers::from([(headers::TARGET.to_owned(), "ruamq.reply.x".into())]),
        };
        assert_eq!(
            from_basic_properties(&to_basic_properties(&properties)),
            properties
        );
        assert_eq!(
            from_basic_properties(&BasicProperties::default()),
            Properties::default()
        );
    }

    #[test]
    fn test_binding_arguments() {
        let table = to_field_table(&HeaderPredicate::target("jobs").to_arguments());
        let arguments = from_field_table(&table);
        assert_eq!(
            arguments.get(headers::X_MATCH).and_then(FieldValue::as_str),
            Some("all")
        );
        assert_eq!(
            arguments.get(headers::TARGET).and_then(FieldValue::as_str),
            Some("jobs")
        );
    }

    #[test]
    fn test_requires_runtime() {
        let err = AmqpBroker::connect("amqp://127.0.0.1:1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
