use crate::client_error;
use crate::config::Config;
use crate::consumer::{Consumer, Handler};
use crate::dev::{read, write};
use crate::error::ErrorKind;
use crate::transport::{AmqpConnector, BrokerChannel, BrokerConnection, CloseNotification, Connector};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Pause between two dials while the broker is unreachable.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Self-healing client of one queue on one broker.
///
/// The client keeps a single connection with a single channel. When the connection fails
/// after it has been established, a background task redials the broker until it succeeds
/// and then starts every registered [`Consumer`] again.
///
/// `Client` is a cheap handle, clones share the same connection and consumers.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: Config,
    pub(crate) addr: String,
    connector: Arc<dyn Connector>,
    state: RwLock<ClientState>,
    /// Publishes go out one at a time on the shared channel.
    pub(crate) publish_gate: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    /// Bumped by every `connect` and `close`. A dial started in an older generation is
    /// dropped instead of becoming the link.
    generation: AtomicU64,
}

/// Link to the broker. A channel exists only on an established connection.
pub(crate) enum Link {
    Disconnected,
    Connected {
        connection: Arc<dyn BrokerConnection>,
        channel: Option<Arc<dyn BrokerChannel>>,
    },
}

struct ClientState {
    link: Link,
    consumers: Vec<Consumer>,
    silence_mode: bool,
    declare_entities: bool,
}

impl Client {
    /// Creates a client which talks to an AMQP broker. It doesn't connect yet.
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, AmqpConnector)
    }

    /// Creates a client on top of any transport, like the [`crate::MemoryBroker`].
    pub fn with_connector<C: Connector + 'static>(config: Config, connector: C) -> Self {
        let addr = config.addr();

        Client {
            inner: Arc::new(ClientInner {
                config,
                addr,
                connector: Arc::new(connector),
                state: RwLock::new(ClientState {
                    link: Link::Disconnected,
                    consumers: vec![],
                    silence_mode: false,
                    declare_entities: false,
                }),
                publish_gate: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Declare the queue and the exchange of the config on every (re)connection.
    pub fn declare_entities(&self, declare: bool) -> &Self {
        write(&self.inner.state).declare_entities = declare;
        self
    }

    /// In silence mode publishes and received messages are not logged.
    pub fn set_silence_mode(&self, mode: bool) -> &Self {
        write(&self.inner.state).silence_mode = mode;
        self
    }

    pub fn get_queue_name(&self) -> &str {
        &self.inner.config.queue
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(read(&self.inner.state).link, Link::Connected { .. })
    }

    /// The open channel, if any.
    pub fn get_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.channel()
    }

    /// Connects to the broker and starts watching the connection.
    ///
    /// A broker which is unreachable at startup is an `Unavailable` error; the caller is not
    /// expected to go on without a broker. Once this returned `Ok`, connection failures are
    /// handled in the background by reconnecting forever.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected to {}", self.inner.addr);

            return Ok(());
        }

        self.inner.closing.store(false, Ordering::SeqCst);

        let generation = self.inner.next_generation();

        match self.inner.establish(generation).await {
            Ok(notification) => {
                spawn_watcher(&self.inner, notification, generation);

                Ok(())
            }
            Err(e) => client_error!(ErrorKind::Unavailable, &self.inner.addr, format!("{e:#}")),
        }
    }

    /// Opens the channel on the current connection. Failures are logged, the client goes on
    /// without a channel.
    pub async fn open_channel(&self) -> &Self {
        self.inner.open_channel().await;
        self
    }

    /// Registers a consumer of the configured queue. An empty tag lets the broker generate one.
    ///
    /// The consumer keeps consuming until it is closed (maintain mode), has a 10 seconds idle
    /// timeout once maintain mode is off and has no delay between deliveries.
    pub fn new_consumer<H: Handler>(&self, handler: H, tag: &str) -> Consumer {
        let consumer = Consumer::new(Arc::downgrade(&self.inner), Arc::new(handler), tag);

        write(&self.inner.state).consumers.push(consumer.clone());

        consumer
    }

    pub fn get_consumers(&self) -> Vec<Consumer> {
        self.inner.consumers()
    }

    /// Stops every consumer, waits until all of them have finished their in-flight handlers
    /// and empties the registry. Removed consumers are not restarted after a reconnection.
    pub async fn clear_consumers(&self) -> &Self {
        let consumers = self.get_consumers();

        for consumer in &consumers {
            consumer.retire();
        }

        join_all(consumers.iter().map(|c| c.close())).await;

        write(&self.inner.state).consumers.retain(|c| !c.is_retired());

        self
    }

    /// Stops the consumers, then closes the channel and the connection. No reconnection
    /// happens after this.
    pub async fn close(&self) {
        info!("Closing connection to {}", self.inner.addr);

        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.next_generation();

        self.clear_consumers().await;

        if let Link::Connected { connection, channel } = self.inner.take_link() {
            if let Some(channel) = channel {
                if let Err(e) = channel.close().await {
                    debug!("Closing channel on {} failed: {:#}", self.inner.addr, e);
                }
            }

            if let Err(e) = connection.close().await {
                error!("Closing connection to {} failed: {:#}", self.inner.addr, e);
            }
        }
    }
}

impl ClientInner {
    pub(crate) fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match &read(&self.state).link {
            Link::Connected { channel, .. } => channel.clone(),
            Link::Disconnected => None,
        }
    }

    pub(crate) fn silence_mode(&self) -> bool {
        read(&self.state).silence_mode
    }

    fn declares_entities(&self) -> bool {
        read(&self.state).declare_entities
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The client still wants the connection of this generation.
    fn is_current(&self, generation: u64) -> bool {
        !self.is_closing() && self.generation.load(Ordering::SeqCst) == generation
    }

    fn consumers(&self) -> Vec<Consumer> {
        read(&self.state).consumers.clone()
    }

    fn take_link(&self) -> Link {
        std::mem::replace(&mut write(&self.state).link, Link::Disconnected)
    }

    /// Dials the broker, opens the channel and declares the topology if asked. Returns the
    /// failure notification of the new connection.
    ///
    /// A connection which arrives after the client was closed or reconnected by someone else
    /// is closed right away and the dial fails.
    async fn establish(&self, generation: u64) -> Result<CloseNotification> {
        let url = self.config.url()?;

        info!(
            "Connecting to {} (queue {:?})",
            self.config.redacted_url(),
            self.config.queue
        );

        let connection = match self.connector.connect(&url, &self.config.properties).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Connection to {} failed: {:#}", self.config.redacted_url(), e);

                return Err(e);
            }
        };

        let notification = connection.notify_close();

        let (stale, previous) = {
            let mut st = write(&self.state);

            if self.is_current(generation) {
                let link = Link::Connected {
                    connection,
                    channel: None,
                };

                (None, std::mem::replace(&mut st.link, link))
            } else {
                (Some(connection), Link::Disconnected)
            }
        };

        if let Some(connection) = stale {
            info!("Dropping connection to {}, it is not needed any more", self.addr);

            if let Err(e) = connection.close().await {
                debug!("Closing the dropped connection to {} failed: {:#}", self.addr, e);
            }

            return Err(anyhow!("Connection to {} is superseded", self.addr));
        }

        if let Link::Connected { connection, .. } = previous {
            if let Err(e) = connection.close().await {
                debug!("Closing the replaced connection to {} failed: {:#}", self.addr, e);
            }
        }

        info!("Connection to {} successful", self.addr);

        self.open_channel().await;

        if self.declares_entities() {
            self.declare_queue().await;
            self.declare_exchange().await;
        }

        Ok(notification)
    }

    pub(crate) async fn open_channel(&self) {
        let connection = match &read(&self.state).link {
            Link::Connected { connection, .. } => connection.clone(),
            Link::Disconnected => {
                error!("Cannot open channel on {}, there is no connection", self.addr);

                return;
            }
        };

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Opening channel on {} failed: {:#}", self.addr, e);

                return;
            }
        };

        if self.config.prefetch_count > 0 {
            if let Err(e) = channel.qos(self.config.prefetch_count).await {
                error!(
                    "Setting prefetch count {} on {} failed: {:#}",
                    self.config.prefetch_count, self.addr, e
                );
            }
        }

        let mut st = write(&self.state);

        match &mut st.link {
            Link::Connected {
                connection: current,
                channel: slot,
            } if Arc::ptr_eq(current, &connection) => {
                *slot = Some(channel);

                info!("Channel opened on {}", self.addr);
            }
            _ => debug!("Connection to {} changed while opening the channel", self.addr),
        }
    }

    /// Starts every registered consumer on the new channel. Consumers still draining their
    /// previous run are started once they have stopped, unless they were removed meanwhile.
    fn reconsume(self: &Arc<Self>) {
        for consumer in self.consumers() {
            let client = Arc::downgrade(self);
            let addr = self.addr.clone();

            tokio::spawn(async move {
                consumer.wait_stopped().await;

                if consumer.is_retired() || client.upgrade().map_or(true, |c| c.is_closing()) {
                    return;
                }

                if let Err(e) = consumer.init().await {
                    error!("Consumer {:?} on {} cannot restart: {:#}", consumer.tag(), addr, e);
                }
            });
        }
    }
}

fn spawn_watcher(client: &Arc<ClientInner>, notification: CloseNotification, generation: u64) {
    let client = Arc::downgrade(client);

    tokio::spawn(watch_connection(client, notification, generation));
}

/// Waits for the failure of the connection. A notification channel closed without a reason
/// means the connection was closed deliberately.
async fn watch_connection(client: Weak<ClientInner>, notification: CloseNotification, generation: u64) {
    let reason = match notification.await {
        Ok(reason) => reason,
        Err(_) => {
            debug!("Connection closed, watcher exits");

            return;
        }
    };

    let Some(inner) = client.upgrade() else {
        return;
    };

    if !inner.is_current(generation) {
        return;
    }

    error!("Reconnecting to {} after connection closed: {}", inner.addr, reason);

    if let Link::Connected { connection, .. } = inner.take_link() {
        if let Err(e) = connection.close().await {
            debug!("Closing the broken connection to {} failed: {:#}", inner.addr, e);
        }
    }

    drop(inner);

    reconnect(client, generation).await;
}

async fn reconnect(client: Weak<ClientInner>, generation: u64) {
    loop {
        let Some(inner) = client.upgrade() else {
            return;
        };

        if !inner.is_current(generation) {
            debug!("Reconnect loop of {} exits", inner.addr);

            return;
        }

        match inner.establish(generation).await {
            Ok(notification) => {
                info!("Reconnected to {}", inner.addr);

                spawn_watcher(&inner, notification, generation);

                if inner.is_current(generation) {
                    inner.reconsume();
                }

                return;
            }
            Err(_) if !inner.is_current(generation) => return,
            Err(e) => {
                error!(
                    "Connection to {} failed, retrying in {:?}: {:#}",
                    inner.addr, RECONNECT_DELAY, e
                );
            }
        }

        drop(inner);

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
