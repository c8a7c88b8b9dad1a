//! Subscriber: discovery polling, subscription registry, drain/await APIs

mod backoff;
mod discovery;
mod rdy;
mod subscription;
mod worker_pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::handler::{FailedMessageHandler, MessageHandler, SharedFailedHandler};
use crate::types::{Channel, SubscriptionId, Topic};
use discovery::DiscoveryClient;
use subscription::Subscription;
use worker_pool::WorkerPool;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a [`Subscriber`]
#[derive(Clone)]
pub struct SubscriberConfig {
    lookup_hosts: Vec<String>,
    lookup_interval: Duration,
    max_lookup_failures_before_error: u32,
    default_max_in_flight: u32,
    max_flush_delay: Duration,
    max_attempts: Option<u32>,
    failed_message_handler: Option<SharedFailedHandler>,
    worker_pool_size: usize,
}

impl std::fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("lookup_hosts", &self.lookup_hosts)
            .field("lookup_interval", &self.lookup_interval)
            .field(
                "max_lookup_failures_before_error",
                &self.max_lookup_failures_before_error,
            )
            .field("default_max_in_flight", &self.default_max_in_flight)
            .field("max_flush_delay", &self.max_flush_delay)
            .field("max_attempts", &self.max_attempts)
            .field("worker_pool_size", &self.worker_pool_size)
            .finish_non_exhaustive()
    }
}

impl SubscriberConfig {
    /// Start building a configuration with the given discovery hosts
    ///
    /// Each host is a base URL, e.g. `"http://lookupd-1:4161"`.
    #[must_use]
    pub fn new(lookup_hosts: Vec<String>) -> Self {
        Self {
            lookup_hosts,
            lookup_interval: Duration::from_secs(60),
            max_lookup_failures_before_error: 5,
            default_max_in_flight: 200,
            max_flush_delay: Duration::from_secs(2),
            max_attempts: None,
            failed_message_handler: None,
            worker_pool_size: 4,
        }
    }

    /// Period between discovery polls. Default 60s.
    #[must_use]
    pub fn lookup_interval(mut self, interval: Duration) -> Self {
        self.lookup_interval = interval;
        self
    }

    /// Threshold at which a per-URL lookup failure log escalates to error.
    /// Default 5.
    #[must_use]
    pub fn max_lookup_failures_before_error(mut self, max: u32) -> Self {
        self.max_lookup_failures_before_error = max;
        self
    }

    /// Initial `maxInFlight` for new subscriptions that don't specify one.
    /// Default 200.
    #[must_use]
    pub fn default_max_in_flight(mut self, n: u32) -> Self {
        self.default_max_in_flight = n;
        self
    }

    /// Cap on the computed requeue delay. Default 2000ms.
    #[must_use]
    pub fn max_flush_delay(mut self, delay: Duration) -> Self {
        self.max_flush_delay = delay;
        self
    }

    /// Cap on broker-side attempt count before dead-lettering. Default
    /// unbounded.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Callback invoked when `max_attempts` is reached for a message.
    #[must_use]
    pub fn failed_message_handler<H: FailedMessageHandler>(mut self, handler: H) -> Self {
        self.failed_message_handler = Some(Arc::new(handler));
        self
    }

    /// Number of tasks in the shared handler worker pool. Default 4.
    #[must_use]
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Build a configuration from environment variables
    ///
    /// Reads `NSQ_LOOKUP_HOSTS` (comma-separated), `NSQ_LOOKUP_INTERVAL_SECS`,
    /// `NSQ_MAX_LOOKUP_FAILURES_BEFORE_ERROR`, `NSQ_DEFAULT_MAX_IN_FLIGHT`,
    /// `NSQ_MAX_FLUSH_DELAY_MILLIS` and `NSQ_MAX_ATTEMPTS`.
    ///
    /// # Panics
    ///
    /// Panics if the environment variables cannot be deserialized.
    #[cfg(feature = "from-env")]
    #[must_use]
    pub fn from_env() -> Self {
        #[derive(serde::Deserialize)]
        struct Env {
            nsq_lookup_hosts: String,
            nsq_lookup_interval_secs: Option<u64>,
            nsq_max_lookup_failures_before_error: Option<u32>,
            nsq_default_max_in_flight: Option<u32>,
            nsq_max_flush_delay_millis: Option<u64>,
            nsq_max_attempts: Option<u32>,
        }

        let env: Env = envy::from_env().expect("SubscriberConfig::from_env deserialization error");
        let hosts = env
            .nsq_lookup_hosts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let mut this = Self::new(hosts);
        if let Some(secs) = env.nsq_lookup_interval_secs {
            this = this.lookup_interval(Duration::from_secs(secs));
        }
        if let Some(max) = env.nsq_max_lookup_failures_before_error {
            this = this.max_lookup_failures_before_error(max);
        }
        if let Some(n) = env.nsq_default_max_in_flight {
            this = this.default_max_in_flight(n);
        }
        if let Some(millis) = env.nsq_max_flush_delay_millis {
            this = this.max_flush_delay(Duration::from_millis(millis));
        }
        if let Some(max) = env.nsq_max_attempts {
            this = this.max_attempts(max);
        }
        this
    }
}

struct Registered {
    subscription: Subscription,
}

/// Owns discovery polling and the set of live subscriptions
pub struct Subscriber {
    config: SubscriberConfig,
    discovery: Arc<DiscoveryClient>,
    worker_pool: Arc<WorkerPool>,
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, Registered>>>,
    lookup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Construct a subscriber and start its discovery polling loop
    #[must_use]
    pub fn new(config: SubscriberConfig) -> Arc<Self> {
        let discovery = Arc::new(DiscoveryClient::new(
            config.lookup_hosts.clone(),
            config.max_lookup_failures_before_error,
        ));
        let worker_pool = Arc::new(WorkerPool::new(config.worker_pool_size));
        let subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let this = Arc::new(Self {
            config,
            discovery,
            worker_pool,
            subscriptions,
            lookup_task: Mutex::new(None),
        });

        let poll_task = Self::spawn_poll_loop(Arc::clone(&this));
        // Stash it behind a blocking-free try_lock: construction is
        // single-threaded at this point so this always succeeds.
        if let Ok(mut guard) = this.lookup_task.try_lock() {
            *guard = Some(poll_task);
        }

        this
    }

    fn spawn_poll_loop(this: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // `interval()`'s first tick fires immediately; each subscribe
            // call already performs its own initial discovery pass, so the
            // periodic loop should only run every `lookup_interval` after
            // that, not race it on construction.
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + this.config.lookup_interval, this.config.lookup_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.poll_once().await;
            }
        })
    }

    async fn poll_once(&self) {
        let topics: Vec<Topic> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .values()
                .map(|r| r.subscription.topic().clone())
                .collect()
        };

        for topic in topics {
            let nodes = self.discovery.lookup(&topic).await;
            let subscriptions = self.subscriptions.lock().await;
            for registered in subscriptions.values() {
                if registered.subscription.topic() == &topic {
                    registered.subscription.reconcile(nodes.clone()).await;
                }
            }
        }
    }

    /// Subscribe to `(topic, channel)` with the configured default `maxInFlight`
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: Topic,
        channel: Channel,
        handler: H,
    ) -> SubscriptionId {
        self.subscribe_with_max_in_flight(topic, channel, self.config.default_max_in_flight, handler)
            .await
    }

    /// Subscribe to `(topic, channel)` with an explicit initial `maxInFlight`
    pub async fn subscribe_with_max_in_flight<H: MessageHandler>(
        &self,
        topic: Topic,
        channel: Channel,
        max_in_flight: u32,
        handler: H,
    ) -> SubscriptionId {
        let subscription = Subscription::spawn(
            topic.clone(),
            channel,
            max_in_flight,
            Arc::new(handler),
            self.config.failed_message_handler.clone(),
            self.config.max_attempts,
            self.config.max_flush_delay,
            Arc::clone(&self.worker_pool),
        );
        let id = subscription.id();

        self.subscriptions
            .lock()
            .await
            .insert(id, Registered { subscription });

        // Kick an immediate lookup so the new subscription doesn't wait a
        // full lookup_interval for its first connections.
        let nodes = self.discovery.lookup(&topic).await;
        if let Some(registered) = self.subscriptions.lock().await.get(&id) {
            registered.subscription.reconcile(nodes).await;
        }

        id
    }

    /// Unsubscribe and close all of this subscription's connections
    ///
    /// Returns `true` if a subscription with this id existed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().await.remove(&id);
        match removed {
            Some(registered) => {
                registered.subscription.close().await;
                true
            }
            None => false,
        }
    }

    /// Apply `maxInFlight = n` to every subscription matching `(topic, channel)`
    pub async fn set_max_in_flight(&self, topic: &Topic, channel: &Channel, n: u32) {
        let subscriptions = self.subscriptions.lock().await;
        for registered in subscriptions.values() {
            if registered.subscription.topic() == topic && registered.subscription.channel() == channel
            {
                registered.subscription.set_max_in_flight(n).await;
            }
        }
    }

    /// Set `maxInFlight = 0` on every subscription
    pub async fn drain_in_flight(&self) {
        let subscriptions = self.subscriptions.lock().await;
        for registered in subscriptions.values() {
            registered.subscription.set_max_in_flight(0).await;
        }
    }

    /// Sum of open connections across all subscriptions
    #[must_use]
    pub async fn connection_count(&self) -> usize {
        let subscriptions = self.subscriptions.lock().await;
        let mut total = 0;
        for registered in subscriptions.values() {
            total += registered.subscription.connection_count().await;
        }
        total
    }

    /// Sum of currently handler-owned messages across all subscriptions
    #[must_use]
    pub async fn current_in_flight_count(&self) -> usize {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .values()
            .map(|r| r.subscription.in_flight_estimate())
            .sum()
    }

    /// Poll [`Self::current_in_flight_count`] every 500ms until it reaches
    /// zero or `timeout` elapses
    pub async fn await_no_messages_in_flight(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.current_in_flight_count().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop discovery polling, close all subscriptions and clear the registry
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.lookup_task.lock().await.take() {
            task.abort();
        }
        let mut subscriptions = self.subscriptions.lock().await;
        for (_, registered) in subscriptions.drain() {
            registered.subscription.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Subscriber, SubscriberConfig};
    use crate::test_support::{slow_success_handler, FakeBroker};
    use crate::types::{Channel, Topic};

    fn noop_handler(
        _message: crate::types::Message,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::handler::HandlerError>> + Send>>
    {
        Box::pin(async { Ok(()) })
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_connection_count() {
        let a = FakeBroker::spawn(0).await;
        let b = FakeBroker::spawn(0).await;

        let subscriber = Subscriber::new(SubscriberConfig::new(Vec::new()).lookup_interval(Duration::from_secs(3600)));
        let topic = Topic::new("t").unwrap();
        let channel = Channel::new("c").unwrap();

        let id = subscriber
            .subscribe_with_max_in_flight(topic.clone(), channel, 10, noop_handler)
            .await;
        // `subscribe_with_max_in_flight` already performed one discovery pass;
        // since there are no lookup hosts configured it finds nothing, so
        // reconcile manually against the fake brokers directly.
        let nodes = std::collections::HashSet::from([a.addr.clone(), b.addr.clone()]);
        if let Some(registered) = subscriber.subscriptions.lock().await.get(&id) {
            registered.subscription.reconcile(nodes).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(2, subscriber.connection_count().await);

        assert!(subscriber.unsubscribe(id).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(0, subscriber.connection_count().await);
    }

    #[tokio::test]
    async fn drain_then_await_returns_once_handlers_finish() {
        let broker = FakeBroker::spawn(5).await;

        let subscriber = Subscriber::new(
            SubscriberConfig::new(Vec::new())
                .lookup_interval(Duration::from_secs(3600))
                .worker_pool_size(5),
        );
        let topic = Topic::new("t").unwrap();
        let channel = Channel::new("c").unwrap();

        let id = subscriber
            .subscribe_with_max_in_flight(topic, channel, 10, slow_success_handler(Duration::from_millis(500)))
            .await;
        let nodes = std::collections::HashSet::from([broker.addr.clone()]);
        if let Some(registered) = subscriber.subscriptions.lock().await.get(&id) {
            registered.subscription.reconcile(nodes).await;
        }

        // Give the fake broker's 5 pushed messages time to be read and dispatched.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(subscriber.current_in_flight_count().await > 0);

        subscriber.drain_in_flight().await;
        let completed = subscriber.await_no_messages_in_flight(Duration::from_secs(10)).await;
        assert!(completed);
    }
}
