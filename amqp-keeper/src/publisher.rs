use crate::client::{Client, ClientInner};
use crate::client_error;
use crate::error::ErrorKind;
use crate::message::{HeaderValue, PublishedMessage, DEFAULT_CONTENT_TYPE, MESSAGE_HEADER_COUNT_ATTEMPT, PLAIN_CONTENT_TYPE};
use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};

/// Something which puts messages onto a queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `body` to the queue of the publisher.
    async fn publish(&self, body: &str) -> Result<()>;

    fn queue_name(&self) -> &str;
}

#[async_trait]
impl Publisher for Client {
    async fn publish(&self, body: &str) -> Result<()> {
        Client::publish(self, body, "").await
    }

    fn queue_name(&self) -> &str {
        self.get_queue_name()
    }
}

impl Client {
    /// Publishes to the configured exchange. An empty routing key means the queue name.
    pub async fn publish(&self, body: &str, routing_key: &str) -> Result<()> {
        let message = self.inner.message(body, routing_key);

        self.inner.send(message).await
    }

    /// Publishes like [`Client::publish`] and records the number of delivery attempts in the
    /// `x-count-attempt` header.
    pub async fn publish_with_count(&self, body: &str, routing_key: &str, count: i32) -> Result<()> {
        let message = self
            .inner
            .message(body, routing_key)
            .header(MESSAGE_HEADER_COUNT_ATTEMPT, HeaderValue::Int(i64::from(count)));

        self.inner.send(message).await
    }

    /// Publishes a plain text message to `exchange` with an empty routing key.
    pub async fn publish_exchange(&self, body: &str, exchange: &str) -> Result<()> {
        let message = PublishedMessage::new(exchange, "", body).content_type(PLAIN_CONTENT_TYPE);

        self.inner.send(message).await
    }
}

impl ClientInner {
    fn message(&self, body: &str, routing_key: &str) -> PublishedMessage {
        let routing_key = if routing_key.is_empty() {
            self.config.queue.as_str()
        } else {
            routing_key
        };

        let content_type = if self.config.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            self.config.content_type.as_str()
        };

        PublishedMessage::new(&self.config.exchange, routing_key, body).content_type(content_type)
    }

    async fn send(&self, message: PublishedMessage) -> Result<()> {
        let Some(channel) = self.channel() else {
            error!(
                "Cannot publish to exchange {:?} with routing key {:?} on {}, channel is not open",
                message.exchange, message.routing_key, self.addr
            );

            return client_error!(ErrorKind::ChannelUnavailable, &self.addr, "Channel is not open");
        };

        let exchange = message.exchange.clone();
        let routing_key = message.routing_key.clone();
        let body_len = message.body.len();

        let _gate = self.publish_gate.lock().await;

        if let Err(e) = channel.publish(message).await {
            error!(
                "Publish to exchange {:?} with routing key {:?} on {} failed: {:#}",
                exchange, routing_key, self.addr, e
            );

            return client_error!(
                ErrorKind::PublishFailure,
                &self.addr,
                format!("Publish to exchange {exchange:?} with routing key {routing_key:?} failed: {e:#}")
            );
        }

        if !self.silence_mode() {
            info!(
                "Published {} bytes to exchange {:?} with routing key {:?}",
                body_len, exchange, routing_key
            );
        }

        Ok(())
    }
}
