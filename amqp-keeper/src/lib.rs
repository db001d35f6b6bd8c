//! Self-healing AMQP 0.9 client.
//!
//! A [`Client`] keeps one connection and one channel to the broker and reconnects in the
//! background when the connection fails. [`Consumer`]s registered on the client are started
//! again after every reconnection.
//!
//! ```no_run
//! use amqp_keeper::{handler_fn, Client, Config, Delivery};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(Config::from_env());
//!
//!     client.declare_entities(true);
//!     client.connect().await?;
//!     client.publish("{\"id\":1}", "").await?;
//!
//!     let consumer = client.new_consumer(
//!         handler_fn(|delivery: Delivery| async move {
//!             let _ = delivery.ack().await;
//!         }),
//!         "",
//!     );
//!
//!     consumer.init().await?;
//!
//!     Ok(())
//! }
//! ```
mod dev;
pub use dev::setup_logger;

mod client;
pub use client::{Client, RECONNECT_DELAY};

pub mod config;
pub use config::Config;

mod consumer;
pub use consumer::{handler_fn, Consumer, Handler, HandlerFn, DEFAULT_CONSUME_IDLE_TIMEOUT, IDLE_CHECK_INTERVAL};

pub mod error;
pub use error::{error_kind, ClientError, ErrorKind};

pub mod message;
pub use message::{get_message_count_attempt, Delivery, HeaderValue, Headers, MESSAGE_HEADER_COUNT_ATTEMPT};

mod publisher;
pub use publisher::Publisher;

mod topology;

pub mod transport;
pub use transport::{AmqpConnector, MemoryBroker};
