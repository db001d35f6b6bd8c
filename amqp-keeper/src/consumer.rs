//! Supervised consumers.
//!
//! A [`Consumer`] reads one queue and hands every delivery to its [`Handler`] on a separate
//! task. [`Consumer::init`] runs until the consumer is closed, its delivery stream ends or, when
//! maintain mode is off, no message arrived for the idle timeout. Before `init` returns, all
//! handler tasks started by that run are finished.
use crate::client::ClientInner;
use crate::client_error;
use crate::dev::lock;
use crate::error::ErrorKind;
use crate::message::Delivery;
use crate::transport::DeliveryStream;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A consumer with maintain mode off stops after this long without deliveries.
pub const DEFAULT_CONSUME_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of the idle check.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Processes the deliveries of a consumer. Acking the delivery is up to the handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

/// Adapter of an async closure to a [`Handler`], see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Makes a handler from an async closure.
///
/// ```no_run
/// use amqp_keeper::{handler_fn, Delivery};
///
/// let handler = handler_fn(|delivery: Delivery| async move {
///     println!("{}", delivery.body_str());
///
///     let _ = delivery.ack().await;
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        (self.f)(delivery).await
    }
}

/// Handle of a consumer registered on a [`crate::Client`]. Clones refer to the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    client: Weak<ClientInner>,
    queue: String,
    tag: String,
    handler: Arc<dyn Handler>,
    settings: Mutex<Settings>,
    state: watch::Sender<RunState>,
    control: Mutex<Control>,
}

/// `Starting` covers the time `init` waits for the broker to open the delivery stream. Only
/// `Running` counts as running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Starting,
    Running,
}

struct Control {
    /// Stop signal of the current run, present unless idle.
    stop: Option<CancellationToken>,
    /// Set when the consumer is removed from its client, it never starts again.
    retired: bool,
}

struct Settings {
    timeout: Duration,
    maintain: bool,
    delay: Duration,
    deadline: Instant,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = lock(&self.inner.settings);

        f.debug_struct("Consumer")
            .field("queue", &self.inner.queue)
            .field("tag", &self.inner.tag)
            .field("running", &self.is_running())
            .field("timeout", &settings.timeout)
            .field("maintain", &settings.maintain)
            .field("delay", &settings.delay)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(client: Weak<ClientInner>, handler: Arc<dyn Handler>, tag: &str) -> Self {
        let queue = client
            .upgrade()
            .map(|c| c.config.queue.clone())
            .unwrap_or_default();
        let (state, _) = watch::channel(RunState::Idle);

        Consumer {
            inner: Arc::new(ConsumerInner {
                client,
                queue,
                tag: tag.to_owned(),
                handler,
                settings: Mutex::new(Settings {
                    timeout: DEFAULT_CONSUME_IDLE_TIMEOUT,
                    maintain: true,
                    delay: Duration::ZERO,
                    deadline: Instant::now() + DEFAULT_CONSUME_IDLE_TIMEOUT,
                }),
                state,
                control: Mutex::new(Control {
                    stop: None,
                    retired: false,
                }),
            }),
        }
    }

    /// Sets the idle timeout and restarts the idle deadline from now.
    pub fn set_timeout(self, timeout: Duration) -> Self {
        {
            let mut settings = lock(&self.inner.settings);

            settings.timeout = timeout;
            settings.deadline = Instant::now() + timeout;
        }

        self
    }

    /// Pause before each delivery is handed to the handler.
    pub fn set_delay(self, delay: Duration) -> Self {
        lock(&self.inner.settings).delay = delay;
        self
    }

    /// In maintain mode the consumer never stops because of idleness.
    pub fn set_maintain(self, maintain: bool) -> Self {
        lock(&self.inner.settings).maintain = maintain;
        self
    }

    /// Consumer tag requested from the broker, empty if the broker generates it.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// True while the delivery loop runs. A consumer whose delivery stream is still being
    /// opened is not running yet.
    pub fn is_running(&self) -> bool {
        *self.inner.state.borrow() == RunState::Running
    }

    pub fn timeout(&self) -> Duration {
        lock(&self.inner.settings).timeout
    }

    pub fn delay(&self) -> Duration {
        lock(&self.inner.settings).delay
    }

    pub fn is_maintain(&self) -> bool {
        lock(&self.inner.settings).maintain
    }

    /// Starts consuming and returns when the consumer has stopped.
    ///
    /// Fails fast with `ChannelUnavailable` without a channel, with `ConsumerRunning` if this
    /// consumer already runs or starts and with `ConsumeInitFailure` if the broker refuses the
    /// consumer or the consumer was removed by [`crate::Client::clear_consumers`].
    pub async fn init(&self) -> Result<()> {
        let Some(client) = self.inner.client.upgrade() else {
            return client_error!(ErrorKind::ChannelUnavailable, "", "Client is dropped");
        };

        let addr = client.addr.clone();

        let Some(channel) = client.channel() else {
            return client_error!(ErrorKind::ChannelUnavailable, &addr, "Channel is not open");
        };

        drop(client);

        let token = CancellationToken::new();

        {
            let mut control = lock(&self.inner.control);

            if control.retired {
                return client_error!(
                    ErrorKind::ConsumeInitFailure,
                    &addr,
                    format!("Consumer {:?} of queue {} is removed", self.inner.tag, self.inner.queue)
                );
            }

            let started = self.inner.state.send_if_modified(|state| {
                if *state == RunState::Idle {
                    *state = RunState::Starting;
                    true
                } else {
                    false
                }
            });

            if !started {
                return client_error!(
                    ErrorKind::ConsumerRunning,
                    &addr,
                    format!("Consumer {:?} of queue {} is already running", self.inner.tag, self.inner.queue)
                );
            }

            control.stop = Some(token.clone());
        }

        let deliveries = match channel.consume(&self.inner.queue, &self.inner.tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!("Consume of queue {} on {} failed: {:#}", self.inner.queue, addr, e);

                self.finish();

                return client_error!(
                    ErrorKind::ConsumeInitFailure,
                    &addr,
                    format!("Consume of queue {} failed: {:#}", self.inner.queue, e)
                );
            }
        };

        info!("Consumer {:?} started on queue {}", self.inner.tag, self.inner.queue);

        self.touch();
        self.inner.state.send_replace(RunState::Running);

        let run = tokio::spawn(self.clone().run(deliveries, token));

        if let Err(e) = run.await {
            error!("Consumer loop of queue {} aborted: {}", self.inner.queue, e);

            self.finish();
        }

        Ok(())
    }

    /// Stops the consumer and waits until its in-flight handlers have finished. Returns at once
    /// on a consumer which doesn't run.
    pub async fn close(&self) {
        let token = lock(&self.inner.control).stop.clone();

        if let Some(token) = token {
            debug!("Stopping consumer {:?} of queue {}", self.inner.tag, self.inner.queue);

            token.cancel();
        }

        self.wait_stopped().await;
    }

    /// Waits until the consumer is idle.
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.inner.state.subscribe();

        // The sender lives in self, so the wait cannot fail.
        let _ = rx.wait_for(|state| *state == RunState::Idle).await;
    }

    /// Marks the consumer as removed from its client. A run which already started is not
    /// affected, later `init` calls fail.
    pub(crate) fn retire(&self) {
        lock(&self.inner.control).retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        lock(&self.inner.control).retired
    }

    fn finish(&self) {
        lock(&self.inner.control).stop.take();

        self.inner.state.send_replace(RunState::Idle);
    }

    fn touch(&self) {
        let mut settings = lock(&self.inner.settings);

        settings.deadline = Instant::now() + settings.timeout;
    }

    fn is_idle(&self) -> bool {
        let settings = lock(&self.inner.settings);

        !settings.maintain && Instant::now() > settings.deadline
    }

    fn silence_mode(&self) -> bool {
        self.inner
            .client
            .upgrade()
            .map(|c| c.silence_mode())
            .unwrap_or(false)
    }

    async fn run(self, mut deliveries: DeliveryStream, stop: CancellationToken) {
        let mut handlers = JoinSet::new();
        let mut tick = tokio::time::interval(IDLE_CHECK_INTERVAL);

        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        tick.reset();

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    debug!("Consumer {:?} of queue {} is stopped", self.inner.tag, self.inner.queue);
                    break;
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    self.handler_finished(joined);
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => self.dispatch(delivery, &mut handlers).await,
                    Some(Err(e)) => {
                        error!("Delivery error on queue {}: {:#}", self.inner.queue, e);
                    }
                    None => {
                        info!("Delivery stream of queue {} closed", self.inner.queue);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if self.is_idle() {
                        info!("Consumer {:?} of queue {} is idle, stopping", self.inner.tag, self.inner.queue);
                        break;
                    }
                }
            }
        }

        drop(deliveries);

        while let Some(joined) = handlers.join_next().await {
            self.handler_finished(joined);
        }

        self.finish();
    }

    async fn dispatch(&self, delivery: Delivery, handlers: &mut JoinSet<()>) {
        if delivery.body.is_empty() {
            debug!("Skipping empty delivery {} on queue {}", delivery.delivery_tag, self.inner.queue);

            return;
        }

        if !self.silence_mode() {
            info!("Message received on queue {}: {}", self.inner.queue, delivery.body_str());
        }

        let delay = self.delay();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let handler = self.inner.handler.clone();

        handlers.spawn(async move { handler.handle(delivery).await });

        self.touch();
    }

    fn handler_finished(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Handler of queue {} panicked", self.inner.queue);
            } else {
                debug!("Handler of queue {} cancelled", self.inner.queue);
            }
        }
    }
}
