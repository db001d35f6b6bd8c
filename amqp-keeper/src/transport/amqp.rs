use super::{BrokerChannel, BrokerConnection, CloseNotification, Connector, DeliveryStream, ExchangeKind};
use crate::dev::lock;
use crate::message::{Acker, Delivery, HeaderValue, Headers, MessageProperties, PublishedMessage};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Connects to a real AMQP 0.9.1 broker with `lapin`.
#[derive(Clone, Debug, Default)]
pub struct AmqpConnector;

struct AmqpConnection {
    connection: Connection,
    close_listener: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

struct AmqpChannel {
    channel: lapin::Channel,
}

/// Cancels the broker side consumer when its delivery stream is dropped.
struct CancelOnDrop {
    channel: lapin::Channel,
    consumer_tag: String,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let channel = self.channel.clone();
        let consumer_tag = std::mem::take(&mut self.consumer_tag);

        rt.spawn(async move {
            if let Err(e) = channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!("Cancel of consumer {} failed: {:?}", consumer_tag, e);
            }
        });
    }
}

/// Settles deliveries through the channel they arrived on.
struct ChannelAcker {
    channel: lapin::Channel,
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn BrokerConnection>> {
        let mut props = ConnectionProperties::default();

        for (k, v) in properties {
            props
                .client_properties
                .insert(ShortString::from(k.clone()), AMQPValue::LongString(LongString::from(v.clone())));
        }

        let connection = Connection::connect(url, props).await?;
        let close_listener = Arc::new(Mutex::new(None::<oneshot::Sender<String>>));
        let listener = close_listener.clone();

        connection.on_error(move |err| {
            warn!("Connection error {:?}", err);

            if let Some(tx) = lock(&listener).take() {
                let _ = tx.send(err.to_string());
            }
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            close_listener,
        }))
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn notify_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();

        *lock(&self.close_listener) = Some(tx);

        rx
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;

        debug!("Channel {} opened", channel.id());

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        // Dropping the listener tells the watcher that this close was intended.
        lock(&self.close_listener).take();

        self.connection.close(200, "Normal close").await?;

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;

        Ok(())
    }

    async fn queue_declare(&self, queue: &str, arguments: &Headers) -> Result<()> {
        let opts = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel.queue_declare(queue, opts, to_field_table(arguments)).await?;

        Ok(())
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        let opts = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .exchange_declare(exchange, kind, opts, FieldTable::default())
            .await?;

        Ok(())
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(&self, message: PublishedMessage) -> Result<()> {
        let mut properties = BasicProperties::default();

        if let Some(content_type) = message.properties.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        if !message.properties.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.properties.headers));
        }

        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let channel = self.channel.clone();
        let guard = CancelOnDrop {
            channel: self.channel.clone(),
            consumer_tag: consumer.tag().as_str().to_owned(),
        };

        let stream = consumer.map(move |delivery| {
            let _ = &guard;

            match delivery {
                Ok(d) => Ok(to_delivery(d, &channel)),
                Err(e) => Err(anyhow::Error::from(e)),
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "Normal close").await?;

        Ok(())
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;

        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;

        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;

        Ok(())
    }
}

fn to_delivery(d: lapin::message::Delivery, channel: &lapin::Channel) -> Delivery {
    let properties = MessageProperties {
        content_type: d.properties.content_type().as_ref().map(|ct| ct.as_str().to_owned()),
        headers: d.properties.headers().as_ref().map(from_field_table).unwrap_or_default(),
    };

    Delivery {
        delivery_tag: d.delivery_tag,
        exchange: d.exchange.as_str().to_owned(),
        routing_key: d.routing_key.as_str().to_owned(),
        redelivered: d.redelivered,
        body: d.data,
        properties,
        acker: Some(Box::new(ChannelAcker {
            channel: channel.clone(),
        })),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    for (k, v) in headers {
        let value = match v {
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => match i32::try_from(*i) {
                Ok(i) => AMQPValue::LongInt(i),
                Err(_) => AMQPValue::LongLongInt(*i),
            },
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };

        table.insert(ShortString::from(k.clone()), value);
    }

    table
}

/// Nested tables, arrays and decimals have no [`HeaderValue`] counterpart, they are skipped.
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| from_amqp_value(v).map(|v| (k.as_str().to_owned(), v)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let v = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
        AMQPValue::Double(f) => HeaderValue::Float(*f),
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_owned()),
        AMQPValue::LongString(s) => HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => return None,
    };

    Some(v)
}
