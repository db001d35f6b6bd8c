use amqp_keeper::message::{Headers, PublishedMessage};
use amqp_keeper::transport::{BrokerChannel, BrokerConnection, CloseNotification, Connector, DeliveryStream, ExchangeKind};
use amqp_keeper::{Client, ClientError, Config, MemoryBroker};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Connected client of `queue` on the in-memory broker, with the queue declared.
#[allow(dead_code)]
pub async fn connect(broker: &MemoryBroker, queue: &str) -> Result<Client> {
    let config = Config {
        queue: queue.to_owned(),
        ..Default::default()
    };
    let client = Client::with_connector(config, broker.clone());

    client.declare_entities(true);
    client.connect().await?;

    Ok(client)
}

/// Like [`connect`] but dials through a [`SlowConnector`].
#[allow(dead_code)]
pub async fn connect_slow(broker: &MemoryBroker, queue: &str, connector: SlowConnector) -> Result<Client> {
    let config = Config {
        queue: queue.to_owned(),
        ..Default::default()
    };
    let client = Client::with_connector(config, connector);

    client.declare_entities(true);
    client.connect().await?;

    assert_eq!(broker.connection_count(), 1);

    Ok(client)
}

/// Waits until the condition holds, panics after 5 seconds.
#[allow(dead_code)]
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[allow(dead_code)]
pub(crate) fn to_client_error<T>(result: Result<T>) -> ClientError {
    result.err().unwrap().downcast::<ClientError>().unwrap()
}

/// The in-memory broker behind a slow network: every dial and every consume waits before it
/// reaches the broker.
#[derive(Clone)]
pub struct SlowConnector {
    pub broker: MemoryBroker,
    pub dial_delay: Duration,
    pub consume_delay: Duration,
}

struct SlowConnection {
    inner: Arc<dyn BrokerConnection>,
    consume_delay: Duration,
}

struct SlowChannel {
    inner: Arc<dyn BrokerChannel>,
    consume_delay: Duration,
}

#[allow(dead_code)]
impl SlowConnector {
    pub fn new(broker: &MemoryBroker) -> Self {
        SlowConnector {
            broker: broker.clone(),
            dial_delay: Duration::ZERO,
            consume_delay: Duration::ZERO,
        }
    }

    pub fn dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    pub fn consume_delay(mut self, delay: Duration) -> Self {
        self.consume_delay = delay;
        self
    }
}

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, url: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn BrokerConnection>> {
        tokio::time::sleep(self.dial_delay).await;

        let inner = self.broker.connect(url, properties).await?;

        Ok(Arc::new(SlowConnection {
            inner,
            consume_delay: self.consume_delay,
        }))
    }
}

#[async_trait]
impl BrokerConnection for SlowConnection {
    fn notify_close(&self) -> CloseNotification {
        self.inner.notify_close()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let inner = self.inner.open_channel().await?;

        Ok(Arc::new(SlowChannel {
            inner,
            consume_delay: self.consume_delay,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl BrokerChannel for SlowChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner.qos(prefetch_count).await
    }

    async fn queue_declare(&self, queue: &str, arguments: &Headers) -> Result<()> {
        self.inner.queue_declare(queue, arguments).await
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        self.inner.exchange_declare(exchange, kind).await
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.inner.queue_bind(queue, routing_key, exchange).await
    }

    async fn publish(&self, message: PublishedMessage) -> Result<()> {
        self.inner.publish(message).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        tokio::time::sleep(self.consume_delay).await;

        self.inner.consume(queue, consumer_tag).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
