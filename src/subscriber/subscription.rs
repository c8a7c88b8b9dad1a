//! One `(topic, channel)` binding: owns connections, reconciles against
//! discovery, distributes RDY credit and runs the backoff state machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backoff::{Backoff, BackoffState};
use super::rdy;
use super::worker_pool::WorkerPool;
use crate::connection::{CloseCause, ConnEvent, SubConnection};
use crate::handler::{SharedFailedHandler, SharedHandler};
use crate::host_port::HostAndPort;
use crate::types::{Channel, Message, SubscriptionId, Topic};

/// Commands sent from the [`Subscription`] handle to its control loop
pub(crate) enum Command {
    Reconcile(HashSet<HostAndPort>),
    SetMaxInFlight(u32),
    ConnectionCount(oneshot::Sender<usize>),
    Close(oneshot::Sender<()>),
}

enum LoopEvent {
    Conn(ConnEvent),
    Command(Command),
    HandlerDone { from: HostAndPort, success: bool },
}

/// A handle to a running subscription's control loop
///
/// All mutation goes through `commands`: the loop is the single consumer
/// serializing reader events against user API calls.
pub(crate) struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    channel: Channel,
    commands: mpsc::Sender<Command>,
    in_flight_estimate: Arc<AtomicUsize>,
}

impl Subscription {
    pub(crate) fn spawn(
        topic: Topic,
        channel: Channel,
        max_in_flight: u32,
        handler: SharedHandler,
        failed_handler: Option<SharedFailedHandler>,
        max_attempts: Option<u32>,
        max_flush_delay: Duration,
        worker_pool: Arc<WorkerPool>,
    ) -> Self {
        let id = SubscriptionId::next();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let in_flight_estimate = Arc::new(AtomicUsize::new(0));

        let state = ControlLoop {
            id,
            topic: topic.clone(),
            channel: channel.clone(),
            connections: HashMap::new(),
            max_in_flight,
            backoff: Backoff::new(),
            in_flight: 0,
            in_flight_estimate: Arc::clone(&in_flight_estimate),
            rotation: 0,
            handler,
            failed_handler,
            max_attempts,
            max_flush_delay,
            worker_pool,
        };
        tokio::spawn(state.run(commands_rx));

        Self {
            id,
            topic,
            channel,
            commands: commands_tx,
            in_flight_estimate,
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn topic(&self) -> &Topic {
        &self.topic
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    /// A cheap, possibly-stale snapshot of in-flight messages, maintained by
    /// the control loop without a channel round trip
    pub(crate) fn in_flight_estimate(&self) -> usize {
        self.in_flight_estimate.load(Ordering::Relaxed)
    }

    pub(crate) async fn reconcile(&self, nodes: HashSet<HostAndPort>) {
        let _ = self.commands.send(Command::Reconcile(nodes)).await;
    }

    pub(crate) async fn set_max_in_flight(&self, n: u32) {
        let _ = self.commands.send(Command::SetMaxInFlight(n)).await;
    }

    pub(crate) async fn connection_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ConnectionCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct ControlLoop {
    id: SubscriptionId,
    topic: Topic,
    channel: Channel,
    connections: HashMap<HostAndPort, Arc<SubConnection>>,
    max_in_flight: u32,
    backoff: Backoff,
    in_flight: usize,
    in_flight_estimate: Arc<AtomicUsize>,
    rotation: usize,
    handler: SharedHandler,
    failed_handler: Option<SharedFailedHandler>,
    max_attempts: Option<u32>,
    max_flush_delay: Duration,
    worker_pool: Arc<WorkerPool>,
}

impl ControlLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (conn_events_tx, mut conn_events_rx) = mpsc::channel(256);
        let (done_tx, mut done_rx) = mpsc::channel::<(HostAndPort, bool)>(256);
        let mut backoff_tick = tokio::time::interval(Duration::from_millis(250));

        loop {
            let event = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => LoopEvent::Command(cmd),
                    None => break,
                },
                ev = conn_events_rx.recv() => match ev {
                    Some(ev) => LoopEvent::Conn(ev),
                    None => continue,
                },
                done = done_rx.recv() => match done {
                    Some((from, success)) => LoopEvent::HandlerDone { from, success },
                    None => continue,
                },
                _ = backoff_tick.tick() => {
                    if self.backoff.ready_to_test() {
                        self.backoff.begin_test();
                        self.rebalance().await;
                    }
                    continue;
                }
            };

            match event {
                LoopEvent::Command(Command::Reconcile(nodes)) => {
                    self.reconcile(nodes, conn_events_tx.clone()).await;
                }
                LoopEvent::Command(Command::SetMaxInFlight(n)) => {
                    self.max_in_flight = n;
                    self.rebalance().await;
                }
                LoopEvent::Command(Command::ConnectionCount(reply)) => {
                    let _ = reply.send(self.connections.len());
                }
                LoopEvent::Command(Command::Close(reply)) => {
                    for conn in self.connections.values() {
                        conn.close().await;
                    }
                    self.connections.clear();
                    let _ = reply.send(());
                    break;
                }
                LoopEvent::Conn(ConnEvent::Message { from, message }) => {
                    self.dispatch(from, message, done_tx.clone());
                }
                LoopEvent::Conn(ConnEvent::Closed { from, cause }) => {
                    self.connections.remove(&from);
                    match cause {
                        CloseCause::Graceful => debug!(sub = %self.id, %from, "connection closed gracefully"),
                        CloseCause::Transport(msg) => {
                            warn!(sub = %self.id, %from, reason = %msg, "connection lost");
                        }
                        CloseCause::Protocol(msg) => {
                            warn!(sub = %self.id, %from, reason = %msg, "connection closed on protocol error");
                        }
                    }
                    self.rebalance().await;
                }
                LoopEvent::HandlerDone { from, success } => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.in_flight_estimate.store(self.in_flight, Ordering::Relaxed);
                    if success {
                        self.backoff.on_handler_success();
                    } else {
                        debug!(sub = %self.id, %from, "handler failed, evaluating backoff");
                        self.backoff.on_handler_failure();
                    }
                    self.rebalance().await;
                }
            }
        }
    }

    async fn reconcile(&mut self, nodes: HashSet<HostAndPort>, events: mpsc::Sender<ConnEvent>) {
        let to_remove: Vec<_> = self
            .connections
            .keys()
            .filter(|addr| !nodes.contains(*addr))
            .cloned()
            .collect();
        for addr in to_remove {
            if let Some(conn) = self.connections.remove(&addr) {
                conn.close().await;
            }
        }

        let to_add: Vec<_> = nodes
            .into_iter()
            .filter(|addr| !self.connections.contains_key(addr))
            .collect();
        for addr in to_add {
            match SubConnection::open(addr.clone(), &self.topic, &self.channel, events.clone())
                .await
            {
                Ok(conn) => {
                    info!(sub = %self.id, %addr, "subscription connection opened");
                    self.connections.insert(addr, Arc::new(conn));
                }
                Err(err) => {
                    warn!(sub = %self.id, %addr, %err, "failed to open subscription connection; will retry on next reconcile");
                }
            }
        }

        self.rebalance().await;
    }

    async fn rebalance(&mut self) {
        let k = self.connections.len();
        if k == 0 {
            return;
        }

        let shares = match self.backoff.state() {
            BackoffState::Normal => {
                self.rotation = self.rotation.wrapping_add(1);
                rdy::distribute(k, self.max_in_flight, self.rotation)
            }
            BackoffState::Backoff => vec![0; k],
            BackoffState::Testing => {
                let mut shares = vec![0; k];
                shares[self.rotation % k] = 1;
                shares
            }
        };

        for (addr, share) in self.connections.keys().cloned().collect::<Vec<_>>().into_iter().zip(shares) {
            if let Some(conn) = self.connections.get(&addr) {
                let _ = conn.rdy(share).await;
            }
        }
    }

    fn dispatch(&mut self, from: HostAndPort, message: Message, done: mpsc::Sender<(HostAndPort, bool)>) {
        let Some(conn) = self.connections.get(&from).cloned() else {
            return;
        };

        let handler = Arc::clone(&self.handler);
        let failed_handler = self.failed_handler.clone();
        let max_attempts = self.max_attempts;
        let max_flush_delay = self.max_flush_delay;

        let requeue_conn = Arc::clone(&conn);
        let requeue_id = message.id;
        let requeue_from = from.clone();

        let spawned = self.worker_pool.try_spawn(Box::pin(async move {
            let outcome = handler.handle(message.clone()).await;
            let success = match outcome {
                Ok(()) => {
                    let _ = conn.fin(message.id).await;
                    true
                }
                Err(err) => {
                    warn!(%err, id = %message.id, attempts = message.attempts, "message handler failed");
                    let exhausted = max_attempts.is_some_and(|max| u32::from(message.attempts) >= max);
                    if exhausted {
                        if let Some(failed_handler) = &failed_handler {
                            failed_handler.failed(message.clone()).await;
                        }
                        let _ = conn.fin(message.id).await;
                    } else {
                        let delay = requeue_delay(message.attempts, max_flush_delay);
                        let _ = conn.req(message.id, delay).await;
                    }
                    false
                }
            };
            let _ = done.send((from, success)).await;
        }));

        if spawned {
            self.in_flight += 1;
            self.in_flight_estimate.store(self.in_flight, Ordering::Relaxed);
        } else {
            // Worker queue is full: the job was never accepted, so it must
            // not count toward in-flight. Requeue immediately rather than
            // drop the message on the floor.
            warn!(from = %requeue_from, id = %requeue_id, "worker pool queue full, requeuing message");
            tokio::spawn(async move {
                let _ = requeue_conn.req(requeue_id, Duration::ZERO).await;
            });
        }
    }
}

fn requeue_delay(attempts: u16, max_flush_delay: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let millis = 100u64.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis).min(max_flush_delay)
}

#[cfg(test)]
mod tests {
    use super::requeue_delay;
    use std::time::Duration;

    #[test]
    fn requeue_delay_grows_exponentially_and_caps() {
        let cap = Duration::from_secs(2);
        assert_eq!(Duration::from_millis(100), requeue_delay(1, cap));
        assert_eq!(Duration::from_millis(200), requeue_delay(2, cap));
        assert_eq!(cap, requeue_delay(10, cap));
    }
}
