use anyhow::Result;
use async_trait::async_trait;
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Header carrying how many times a message has been published again for a retry.
pub const MESSAGE_HEADER_COUNT_ATTEMPT: &str = "x-count-attempt";

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const PLAIN_CONTENT_TYPE: &str = "text/plain";

/// Value of a message header or of a declare argument.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

pub type Headers = HashMap<String, HeaderValue>;

/// The subset of AMQP basic properties this client reads and writes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub headers: Headers,
}

/// A message going to the broker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    pub fn new(exchange: &str, routing_key: &str, body: &str) -> Self {
        PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.as_bytes().to_vec(),
            properties: MessageProperties::default(),
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.properties.content_type = Some(content_type.to_owned());
        self
    }

    pub fn header(mut self, name: &str, value: HeaderValue) -> Self {
        self.properties.headers.insert(name.to_owned(), value);
        self
    }
}

/// Settles a delivery on the broker. Implemented by the transports.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// A message delivered to a consumer.
///
/// Deliveries are consumed with manual acknowledgement, so the handler should `ack`, `nack`
/// or `reject` them. A delivery which is dropped unsettled stays unacked until the channel
/// closes and then the broker redelivers it.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub(crate) acker: Option<Box<dyn Acker>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("properties", &self.properties)
            .finish()
    }
}

impl Delivery {
    /// A delivery without a broker behind it, handy for testing handlers.
    pub fn detached(body: &[u8], headers: Headers) -> Self {
        Delivery {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            body: body.to_vec(),
            properties: MessageProperties {
                content_type: None,
                headers,
            },
            acker: None,
        }
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn count_attempt(&self) -> i32 {
        get_message_count_attempt(self)
    }

    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.nack(self.delivery_tag, requeue).await,
            None => Ok(()),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject(self.delivery_tag, requeue).await,
            None => Ok(()),
        }
    }
}

/// Returns the retry attempt number stamped by [`crate::Client::publish_with_count`], 0 if the
/// header is missing or isn't an integer which fits in 32 bits.
pub fn get_message_count_attempt(delivery: &Delivery) -> i32 {
    match delivery.properties.headers.get(MESSAGE_HEADER_COUNT_ATTEMPT) {
        Some(HeaderValue::Int(v)) => i32::try_from(*v).unwrap_or(0),
        _ => 0,
    }
}
