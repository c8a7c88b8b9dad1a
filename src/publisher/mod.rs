//! Publishing messages to a topic with a configurable atomicity policy

mod balance;
mod node_health;

use bytes::Bytes;
use tracing::{info, warn};

use crate::error::{
    AtomicBatchPublishFailed, InvalidArgument, PublishCause, PublishFailed, PublisherError,
};
use crate::host_port::HostAndPort;
use crate::types::Topic;
use balance::BalanceStrategy;

/// Configuration for a [`Publisher`]
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    addrs: Vec<HostAndPort>,
    atomic: bool,
}

impl PublisherConfig {
    /// Start building a configuration targeting the given broker nodes
    #[must_use]
    pub fn new(addrs: Vec<HostAndPort>) -> Self {
        Self {
            addrs,
            atomic: false,
        }
    }

    /// If `true`, a failed batch publish never falls back to per-message
    /// publishing — the whole batch fails atomically.
    ///
    /// Default: `false`.
    #[must_use]
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Build the [`Publisher`]
    #[must_use]
    pub fn build(self) -> Publisher {
        Publisher {
            strategy: BalanceStrategy::new(self.addrs),
            atomic: self.atomic,
        }
    }

    /// Build a configuration from environment variables
    ///
    /// Reads `NSQ_PUBLISHER_ADDRS` (comma-separated `host:port` list) and
    /// `NSQ_PUBLISHER_ATOMIC`.
    ///
    /// # Panics
    ///
    /// Panics if the environment variables cannot be deserialized.
    #[cfg(feature = "from-env")]
    #[must_use]
    pub fn from_env() -> Self {
        #[derive(serde::Deserialize)]
        struct Env {
            nsq_publisher_addrs: String,
            nsq_publisher_atomic: Option<bool>,
        }

        let env: Env = envy::from_env().expect("PublisherConfig::from_env deserialization error");
        let addrs = env
            .nsq_publisher_addrs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|addr| HostAndPort::parse(addr, 4150))
            .collect();

        let mut this = Self::new(addrs);
        if let Some(atomic) = env.nsq_publisher_atomic {
            this = this.atomic(atomic);
        }
        this
    }
}

/// Publishes single messages and batches to broker topics
///
/// See [`Publisher::publish_batch`] for its exact atomicity contract.
#[derive(Debug)]
pub struct Publisher {
    strategy: BalanceStrategy,
    atomic: bool,
}

impl Publisher {
    /// Start building a [`Publisher`]
    #[must_use]
    pub fn builder(addrs: Vec<HostAndPort>) -> PublisherConfig {
        PublisherConfig::new(addrs)
    }

    /// Publish a single message, retrying once on a different node on failure
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::NoNodesAvailable`] if no nodes are
    /// configured, or [`PublisherError::PublishFailed`] if both the initial
    /// attempt and the retry fail.
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: impl Into<Bytes>,
    ) -> Result<(), PublisherError> {
        let payload = payload.into();
        self.publish_with_retry(topic, payload).await
    }

    async fn publish_with_retry(&self, topic: &Topic, payload: Bytes) -> Result<(), PublisherError> {
        let node = self.strategy.pick().await?;
        let conn = node.connection().await;
        let attempt = match conn {
            Ok(conn) => conn.publish(topic, payload.clone()).await,
            Err(err) => Err(PublishCause::Transport(err)),
        };

        if attempt.is_ok() {
            return Ok(());
        }
        node.mark_failure().await;
        warn!(node = %node.addr(), "publish attempt failed, retrying on another node");

        let retry_node = self.strategy.pick_excluding(node.addr()).await?;
        let retry_conn = retry_node.connection().await;
        let retry_attempt = match retry_conn {
            Ok(conn) => conn.publish(topic, payload).await,
            Err(err) => Err(PublishCause::Transport(err)),
        };

        match retry_attempt {
            Ok(()) => Ok(()),
            Err(cause) => {
                retry_node.mark_failure().await;
                Err(PublisherError::PublishFailed(PublishFailed(cause)))
            }
        }
    }

    /// Publish a batch of messages
    ///
    /// Attempts a single `MPUB`. On failure, behavior depends on
    /// [`PublisherConfig::atomic`]: when `true`, the call fails with
    /// [`PublisherError::AtomicBatchPublishFailed`] and no per-message
    /// publish is attempted; when `false`, falls back to per-message
    /// publishing in order, absorbing individual failures.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::InvalidArgument`] synchronously if
    /// `payloads` is empty, without performing any network I/O.
    pub async fn publish_batch(
        &self,
        topic: &Topic,
        payloads: Vec<Bytes>,
    ) -> Result<(), PublisherError> {
        if payloads.is_empty() {
            return Err(InvalidArgument::EmptyBatch.into());
        }

        let node = self.strategy.pick().await?;
        let conn = node.connection().await;
        let attempt = match conn {
            Ok(conn) => conn.publish_batch(topic, payloads.clone()).await,
            Err(err) => Err(PublishCause::Transport(err)),
        };

        let Err(cause) = attempt else {
            return Ok(());
        };

        node.mark_failure().await;

        if self.atomic {
            return Err(AtomicBatchPublishFailed {
                batch_size: payloads.len(),
                cause: Box::new(PublishFailed(cause)),
            }
            .into());
        }

        warn!(
            node = %node.addr(),
            batch_size = payloads.len(),
            "MPUB failed, falling back to per-message publish"
        );
        let mut failures = 0usize;
        for payload in payloads {
            if let Err(err) = self.publish_single_attempt(topic, payload).await {
                failures += 1;
                warn!(%err, "per-message publish failed during batch fallback");
            }
        }
        if failures > 0 {
            info!(failures, "batch fallback completed with partial failures");
        }
        Ok(())
    }

    /// A single publish attempt with no retry and no node failure marking
    ///
    /// Used only by the non-atomic batch fallback path: the node failure for
    /// a fallback batch is marked exactly once, for the `MPUB` itself, not
    /// again per individual message.
    async fn publish_single_attempt(
        &self,
        topic: &Topic,
        payload: Bytes,
    ) -> Result<(), PublishCause> {
        let node = self
            .strategy
            .pick()
            .await
            .map_err(|_| PublishCause::Transport(crate::error::TransportError::Closed(
                "no nodes available".to_owned(),
            )))?;
        let result = match node.connection().await {
            Ok(conn) => conn.publish(topic, payload).await,
            Err(err) => Err(PublishCause::Transport(err)),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_matches;

    use super::Publisher;
    use crate::error::{InvalidArgument, PublisherError};
    use crate::types::Topic;

    #[tokio::test]
    async fn empty_batch_is_invalid_argument_without_io() {
        let publisher = Publisher::builder(Vec::new()).build();
        let topic = Topic::new("t").unwrap();
        assert_matches!(
            publisher.publish_batch(&topic, Vec::new()).await,
            Err(PublisherError::InvalidArgument(InvalidArgument::EmptyBatch))
        );
    }

    #[tokio::test]
    async fn no_nodes_configured() {
        let publisher = Publisher::builder(Vec::new()).build();
        let topic = Topic::new("t").unwrap();
        assert_matches!(
            publisher.publish(&topic, "hi").await,
            Err(PublisherError::NoNodesAvailable(_))
        );
    }
}
