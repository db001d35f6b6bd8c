//! Declaration of the queue, the exchange and the bindings. Failures here are logged and the
//! client goes on, the broker may already have the entities.
use crate::client::{Client, ClientInner};
use crate::client_error;
use crate::error::ErrorKind;
use crate::transport::ExchangeKind;
use anyhow::Result;
use log::{error, info};

impl Client {
    /// Declares the configured queue as durable with the configured arguments.
    pub async fn declare_queue(&self) -> &Self {
        self.inner.declare_queue().await;
        self
    }

    /// Declares the configured exchange as a durable direct exchange. Does nothing when no
    /// exchange is configured.
    pub async fn declare_exchange(&self) -> &Self {
        self.inner.declare_exchange().await;
        self
    }

    pub async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> &Self {
        if let Err(e) = self.inner.try_queue_bind(queue, routing_key, exchange).await {
            error!("{:#}", e);
        }

        self
    }
}

impl ClientInner {
    pub(crate) async fn declare_queue(&self) {
        if let Err(e) = self.try_declare_queue().await {
            error!("{:#}", e);
        }
    }

    pub(crate) async fn declare_exchange(&self) {
        if let Err(e) = self.try_declare_exchange().await {
            error!("{:#}", e);
        }
    }

    async fn try_declare_queue(&self) -> Result<()> {
        let queue = &self.config.queue;

        let Some(channel) = self.channel() else {
            return client_error!(
                ErrorKind::ChannelUnavailable,
                &self.addr,
                format!("Cannot declare queue {queue}, channel is not open")
            );
        };

        if let Err(e) = channel.queue_declare(queue, &self.config.arguments).await {
            return client_error!(
                ErrorKind::DeclareFailure,
                &self.addr,
                format!("Declare of queue {queue} failed: {e:#}")
            );
        }

        info!("Queue {} declared on {}", queue, self.addr);

        Ok(())
    }

    async fn try_declare_exchange(&self) -> Result<()> {
        let exchange = &self.config.exchange;

        if exchange.is_empty() {
            return Ok(());
        }

        let Some(channel) = self.channel() else {
            return client_error!(
                ErrorKind::ChannelUnavailable,
                &self.addr,
                format!("Cannot declare exchange {exchange}, channel is not open")
            );
        };

        if let Err(e) = channel.exchange_declare(exchange, ExchangeKind::Direct).await {
            return client_error!(
                ErrorKind::DeclareFailure,
                &self.addr,
                format!("Declare of exchange {exchange} failed: {e:#}")
            );
        }

        info!("Exchange {} declared on {}", exchange, self.addr);

        Ok(())
    }

    async fn try_queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let Some(channel) = self.channel() else {
            return client_error!(
                ErrorKind::ChannelUnavailable,
                &self.addr,
                format!("Cannot bind queue {queue} to exchange {exchange}, channel is not open")
            );
        };

        if let Err(e) = channel.queue_bind(queue, routing_key, exchange).await {
            return client_error!(
                ErrorKind::DeclareFailure,
                &self.addr,
                format!("Bind of queue {queue} to exchange {exchange} with key {routing_key:?} failed: {e:#}")
            );
        }

        info!("Queue {} bound to exchange {} with key {:?}", queue, exchange, routing_key);

        Ok(())
    }
}
