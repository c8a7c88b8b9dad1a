//! Per-node publisher-side health bookkeeping

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::connection::PubConnection;
use crate::error::TransportError;
use crate::host_port::HostAndPort;

/// How long a node is skipped by the balance strategy after a failure
pub(crate) const FAILURE_BACKOFF: Duration = Duration::from_secs(10);

/// A publisher-side record for one broker node
///
/// Invariant: at most one [`PubConnection`] is held at a time; marking a
/// failure is idempotent within [`FAILURE_BACKOFF`].
#[derive(Debug)]
pub(crate) struct NsqdInstance {
    addr: HostAndPort,
    conn: Mutex<Option<PubConnection>>,
    last_failure_at: Mutex<Option<Instant>>,
}

impl NsqdInstance {
    pub(crate) fn new(addr: HostAndPort) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
            last_failure_at: Mutex::new(None),
        }
    }

    pub(crate) fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    /// Return the open connection, opening one on demand
    pub(crate) async fn connection(&self) -> Result<tokio::sync::MappedMutexGuard<'_, PubConnection>, TransportError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() || guard.as_ref().is_some_and(PubConnection::is_closed) {
            let new_conn = PubConnection::open(self.addr.clone()).await?;
            *guard = Some(new_conn);
        }
        Ok(tokio::sync::MutexGuard::map(guard, |conn| {
            conn.as_mut().expect("just populated above")
        }))
    }

    /// Record a failure; idempotent within [`FAILURE_BACKOFF`]
    pub(crate) async fn mark_failure(&self) {
        let mut last_failure_at = self.last_failure_at.lock().await;
        let now = Instant::now();
        let is_recent = last_failure_at.is_some_and(|at| now.duration_since(at) < FAILURE_BACKOFF);
        if !is_recent {
            *last_failure_at = Some(now);
        }
        let mut conn = self.conn.lock().await;
        *conn = None;
    }

    /// `true` if this node failed within [`FAILURE_BACKOFF`]
    pub(crate) async fn is_healthy(&self) -> bool {
        let last_failure_at = self.last_failure_at.lock().await;
        !last_failure_at.is_some_and(|at| Instant::now().duration_since(at) < FAILURE_BACKOFF)
    }

    /// How long ago this node last failed, `None` if it never has
    pub(crate) async fn failed_ago(&self) -> Option<Duration> {
        let last_failure_at = self.last_failure_at.lock().await;
        last_failure_at.map(|at| Instant::now().duration_since(at))
    }
}

#[cfg(test)]
mod tests {
    use super::NsqdInstance;
    use crate::host_port::HostAndPort;

    #[tokio::test]
    async fn starts_healthy() {
        let instance = NsqdInstance::new(HostAndPort::new("localhost", 4150));
        assert!(instance.is_healthy().await);
        assert_eq!(None, instance.failed_ago().await);
    }

    #[tokio::test]
    async fn mark_failure_is_idempotent_within_window() {
        let instance = NsqdInstance::new(HostAndPort::new("localhost", 4150));
        instance.mark_failure().await;
        assert!(!instance.is_healthy().await);
        let first = instance.failed_ago().await.unwrap();

        instance.mark_failure().await;
        let second = instance.failed_ago().await.unwrap();
        // still within the same failure window, not reset to a fresh timestamp far apart
        assert!(second >= first);
    }
}
