//! The seam between the client and the broker protocol library.
//!
//! A [`Connector`] dials the broker and yields a [`BrokerConnection`], which opens one
//! [`BrokerChannel`] per client. Everything above this module talks only to these traits, so
//! the same client logic runs against RabbitMQ (via [`AmqpConnector`]) and against the
//! in-process [`MemoryBroker`].

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, Settlement, DEFAULT_JOURNAL_LIMIT};

use crate::message::{Delivery, Headers, PublishedMessage};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Stream of deliveries of one consumer. It ends when the consumer is cancelled or the
/// channel or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Fires with the reason when the connection fails. If the sender is dropped without a value
/// the connection was closed on purpose.
pub type CloseNotification = oneshot::Receiver<String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection. `url` is an AMQP URI, `properties` are the client properties
    /// presented to the broker.
    async fn connect(&self, url: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Registers the failure listener. Only the last registered listener is notified.
    fn notify_close(&self) -> CloseNotification;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Count-based, non-global prefetch limit.
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Declares a durable, non-exclusive queue which isn't deleted when unused.
    async fn queue_declare(&self, queue: &str, arguments: &Headers) -> Result<()>;

    /// Declares a durable exchange which isn't deleted when unused.
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()>;

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Publishes without the mandatory and immediate flags.
    async fn publish(&self, message: PublishedMessage) -> Result<()>;

    /// Starts a manually acknowledged, non-exclusive consumer. An empty tag lets the broker
    /// generate one.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}
