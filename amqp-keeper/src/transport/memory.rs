//! An in-process broker speaking the transport traits.
//!
//! It keeps queues, exchanges and bindings in memory, delivers published messages round-robin
//! to the consumers of a queue and tracks unacked deliveries per connection. Tests use its
//! control methods to refuse dials or to kill connections like a network failure would.

use super::{BrokerChannel, BrokerConnection, CloseNotification, Connector, DeliveryStream, ExchangeKind};
use crate::dev::lock;
use crate::message::{Acker, Delivery, Headers, PublishedMessage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Shared = Arc<Mutex<BrokerState>>;

/// Entries kept in the publish and settlement journals unless changed with
/// [`MemoryBroker::set_journal_limit`].
pub const DEFAULT_JOURNAL_LIMIT: usize = 10_000;

/// How a delivery was settled by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// Handle of the in-memory broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
}

struct BrokerState {
    available: bool,
    channels_fail: bool,
    dial_attempts: usize,
    last_url: Option<String>,
    client_properties: HashMap<String, String>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, ConnectionSlot>,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    prefetch: Option<u16>,
    /// Journals for inspection, the oldest entries are dropped beyond `journal_limit`.
    journal_limit: usize,
    published: VecDeque<PublishedMessage>,
    unacked: HashMap<u64, Unacked>,
    settled: VecDeque<(u64, Settlement)>,
}

#[derive(Default)]
struct ConnectionSlot {
    close_listener: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
struct QueueState {
    arguments: Headers,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ExchangeState {
    kind: ExchangeKind,
    /// (routing key, queue) pairs
    bindings: Vec<(String, String)>,
}

struct ConsumerSlot {
    connection_id: u64,
    consumer_tag: String,
    sink: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Stored {
    message: PublishedMessage,
    redelivered: bool,
}

struct Unacked {
    connection_id: u64,
    queue: String,
    message: PublishedMessage,
}

struct MemoryConnection {
    id: u64,
    state: Shared,
}

struct MemoryChannel {
    connection_id: u64,
    state: Shared,
}

struct MemoryAcker {
    state: Shared,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                channels_fail: false,
                dial_attempts: 0,
                last_url: None,
                client_properties: HashMap::new(),
                next_connection_id: 1,
                next_delivery_tag: 1,
                connections: HashMap::new(),
                queues: HashMap::new(),
                exchanges: HashMap::new(),
                prefetch: None,
                journal_limit: DEFAULT_JOURNAL_LIMIT,
                published: VecDeque::new(),
                unacked: HashMap::new(),
                settled: VecDeque::new(),
            })),
        }
    }

    /// When not available, every dial is refused.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// Caps how many published messages and settlements are remembered for inspection.
    pub fn set_journal_limit(&self, limit: usize) {
        let mut st = lock(&self.state);

        st.journal_limit = limit;
        trim_journal(&mut st.published, limit);
        trim_journal(&mut st.settled, limit);
    }

    /// When set, opening a channel fails on every connection.
    pub fn set_channels_fail(&self, fail: bool) {
        lock(&self.state).channels_fail = fail;
    }

    /// Drops every live connection as if the network went away. The close listeners get
    /// `reason`, the delivery streams end and unacked messages go back to their queues.
    pub fn fail_connections(&self, reason: &str) {
        let mut st = lock(&self.state);
        let ids: Vec<u64> = st.connections.keys().copied().collect();

        for id in ids {
            if let Some(mut slot) = st.connections.remove(&id) {
                if let Some(listener) = slot.close_listener.take() {
                    let _ = listener.send(reason.to_owned());
                }
            }

            st.drop_connection_resources(id, &self.state);
        }
    }

    pub fn dial_attempts(&self) -> usize {
        lock(&self.state).dial_attempts
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn last_url(&self) -> Option<String> {
        lock(&self.state).last_url.clone()
    }

    pub fn client_properties(&self) -> HashMap<String, String> {
        lock(&self.state).client_properties.clone()
    }

    /// The latest messages accepted by the broker, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.iter().cloned().collect()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<Headers> {
        lock(&self.state).queues.get(queue).map(|q| q.arguments.clone())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).map(|x| x.kind)
    }

    pub fn is_bound(&self, queue: &str, routing_key: &str, exchange: &str) -> bool {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map(|x| x.bindings.iter().any(|(rk, q)| rk == routing_key && q == queue))
            .unwrap_or(false)
    }

    /// Number of messages waiting in the queue for a consumer.
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map(|q| q.messages.len()).unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        let mut st = lock(&self.state);

        match st.queues.get_mut(queue) {
            Some(q) => {
                q.consumers.retain(|c| !c.sink.is_closed());
                q.consumers.len()
            }
            None => 0,
        }
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.consumer_tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn prefetch(&self) -> Option<u16> {
        lock(&self.state).prefetch
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    pub fn settled(&self) -> Vec<(u64, Settlement)> {
        lock(&self.state).settled.iter().copied().collect()
    }
}

fn trim_journal<T>(journal: &mut VecDeque<T>, limit: usize) {
    while journal.len() > limit {
        journal.pop_front();
    }
}

impl BrokerState {
    fn is_live(&self, connection_id: u64) -> bool {
        self.connections.contains_key(&connection_id)
    }

    fn check_live(&self, connection_id: u64) -> Result<()> {
        if self.is_live(connection_id) {
            Ok(())
        } else {
            Err(anyhow!("Connection {} is closed", connection_id))
        }
    }

    /// Ends the delivery streams of the connection and requeues what it hasn't acked yet.
    fn drop_connection_resources(&mut self, connection_id: u64, shared: &Shared) {
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| c.connection_id != connection_id);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = vec![];

        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&u.queue) {
                    q.messages.push_front(Stored {
                        message: u.message,
                        redelivered: true,
                    });
                    touched.push(u.queue);
                }
            }
        }

        for queue in touched {
            self.dispatch(&queue, shared);
        }
    }

    /// Target queues of a publish.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                return Ok(vec![routing_key.to_owned()]);
            }

            return Ok(vec![]);
        }

        match self.exchanges.get(exchange) {
            Some(x) => {
                let queues = x
                    .bindings
                    .iter()
                    .filter(|(rk, _)| x.kind == ExchangeKind::Fanout || rk == routing_key)
                    .map(|(_, q)| q.clone())
                    .collect();

                Ok(queues)
            }
            None => Err(anyhow!("NOT_FOUND - no exchange '{}'", exchange)),
        }
    }

    /// Pushes ready messages of the queue to its consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str, shared: &Shared) {
        loop {
            let tag = self.next_delivery_tag;

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };

            queue.consumers.retain(|c| !c.sink.is_closed());

            if queue.consumers.is_empty() {
                return;
            }

            let Some(stored) = queue.messages.pop_front() else {
                return;
            };

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = idx + 1;

            let consumer = &queue.consumers[idx];

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: stored.message.exchange.clone(),
                routing_key: stored.message.routing_key.clone(),
                redelivered: stored.redelivered,
                body: stored.message.body.clone(),
                properties: stored.message.properties.clone(),
                acker: Some(Box::new(MemoryAcker { state: shared.clone() })),
            };

            trace!("Deliver {} to {}", tag, consumer.consumer_tag);

            if consumer.sink.send(Ok(delivery)).is_err() {
                queue.messages.push_front(stored);
                continue;
            }

            let connection_id = consumer.connection_id;

            self.next_delivery_tag += 1;
            self.unacked.insert(
                tag,
                Unacked {
                    connection_id,
                    queue: queue_name.to_owned(),
                    message: stored.message,
                },
            );
        }
    }

    fn settle(&mut self, delivery_tag: u64, settlement: Settlement, shared: &Shared) -> Result<()> {
        let Some(unacked) = self.unacked.remove(&delivery_tag) else {
            return Err(anyhow!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag));
        };

        self.settled.push_back((delivery_tag, settlement));
        trim_journal(&mut self.settled, self.journal_limit);

        let requeue = matches!(
            settlement,
            Settlement::Nack { requeue: true } | Settlement::Reject { requeue: true }
        );

        if requeue {
            if let Some(q) = self.queues.get_mut(&unacked.queue) {
                q.messages.push_back(Stored {
                    message: unacked.message,
                    redelivered: true,
                });
            }

            self.dispatch(&unacked.queue, shared);
        }

        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn BrokerConnection>> {
        let mut st = lock(&self.state);

        st.dial_attempts += 1;
        st.last_url = Some(url.to_owned());

        if !st.available {
            return Err(anyhow!("Connection refused"));
        }

        st.client_properties = properties.clone();

        let id = st.next_connection_id;

        st.next_connection_id += 1;
        st.connections.insert(id, ConnectionSlot::default());

        debug!("Memory connection {} opened", id);

        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn notify_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        let mut st = lock(&self.state);

        match st.connections.get_mut(&self.id) {
            Some(slot) => slot.close_listener = Some(tx),
            None => {
                let _ = tx.send("connection is already closed".to_owned());
            }
        }

        rx
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let st = lock(&self.state);

        st.check_live(self.id)?;

        if st.channels_fail {
            return Err(anyhow!("CHANNEL_ERROR - channel cannot be opened"));
        }

        Ok(Arc::new(MemoryChannel {
            connection_id: self.id,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut st = lock(&self.state);

        // Dropping the slot drops the close listener without a value.
        if st.connections.remove(&self.id).is_some() {
            st.drop_connection_resources(self.id, &self.state);
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;
        st.prefetch = Some(prefetch_count);

        Ok(())
    }

    async fn queue_declare(&self, queue: &str, arguments: &Headers) -> Result<()> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;

        match st.queues.get(queue) {
            Some(q) if q.arguments != *arguments => Err(anyhow!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                queue
            )),
            Some(_) => Ok(()),
            None => {
                st.queues.insert(
                    queue.to_owned(),
                    QueueState {
                        arguments: arguments.clone(),
                        ..Default::default()
                    },
                );

                Ok(())
            }
        }
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;

        match st.exchanges.get(exchange) {
            Some(x) if x.kind != kind => Err(anyhow!(
                "PRECONDITION_FAILED - inequivalent type for exchange '{}'",
                exchange
            )),
            Some(_) => Ok(()),
            None => {
                st.exchanges.insert(
                    exchange.to_owned(),
                    ExchangeState {
                        kind,
                        bindings: vec![],
                    },
                );

                Ok(())
            }
        }
    }

    async fn queue_bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;

        if !st.queues.contains_key(queue) {
            return Err(anyhow!("NOT_FOUND - no queue '{}'", queue));
        }

        let Some(x) = st.exchanges.get_mut(exchange) else {
            return Err(anyhow!("NOT_FOUND - no exchange '{}'", exchange));
        };

        let binding = (routing_key.to_owned(), queue.to_owned());

        if !x.bindings.contains(&binding) {
            x.bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(&self, message: PublishedMessage) -> Result<()> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;

        let targets = st.route(&message.exchange, &message.routing_key)?;

        let limit = st.journal_limit;

        st.published.push_back(message.clone());
        trim_journal(&mut st.published, limit);

        for queue in targets {
            if let Some(q) = st.queues.get_mut(&queue) {
                q.messages.push_back(Stored {
                    message: message.clone(),
                    redelivered: false,
                });
            }

            st.dispatch(&queue, &self.state);
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut st = lock(&self.state);

        st.check_live(self.connection_id)?;

        let consumer_tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", rand::random::<u64>())
        } else {
            consumer_tag.to_owned()
        };

        let Some(q) = st.queues.get_mut(queue) else {
            return Err(anyhow!("NOT_FOUND - no queue '{}'", queue));
        };

        if q.consumers.iter().any(|c| c.consumer_tag == consumer_tag && !c.sink.is_closed()) {
            return Err(anyhow!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag));
        }

        let (sink, stream) = mpsc::unbounded_channel();

        q.consumers.push(ConsumerSlot {
            connection_id: self.connection_id,
            consumer_tag,
            sink,
        });

        st.dispatch(queue, &self.state);

        Ok(UnboundedReceiverStream::new(stream).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut st = lock(&self.state);

        for q in st.queues.values_mut() {
            q.consumers.retain(|c| c.connection_id != self.connection_id);
        }

        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        lock(&self.state).settle(delivery_tag, Settlement::Ack, &self.state)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        lock(&self.state).settle(delivery_tag, Settlement::Nack { requeue }, &self.state)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        lock(&self.state).settle(delivery_tag, Settlement::Reject { requeue }, &self.state)
    }
}
