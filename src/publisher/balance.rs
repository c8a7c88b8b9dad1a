//! Node selection for publishing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::node_health::NsqdInstance;
use crate::error::NoNodesAvailable;
use crate::host_port::HostAndPort;

/// Picks which broker node a publish attempt should use
///
/// A single configured host behaves trivially (always that node). With
/// multiple hosts, selection is round-robin with failover: nodes that
/// failed within the backoff window are skipped unless every node is
/// currently unhealthy, in which case the least-recently-failed node is
/// returned rather than failing the call outright.
#[derive(Debug)]
pub(crate) struct BalanceStrategy {
    nodes: RwLock<Vec<Arc<NsqdInstance>>>,
    next: AtomicUsize,
}

impl BalanceStrategy {
    pub(crate) fn new(addrs: Vec<HostAndPort>) -> Self {
        Self {
            nodes: RwLock::new(
                addrs
                    .into_iter()
                    .map(|addr| Arc::new(NsqdInstance::new(addr)))
                    .collect(),
            ),
            next: AtomicUsize::new(0),
        }
    }

    /// Select a node, opening its connection on demand
    ///
    /// # Errors
    ///
    /// Returns [`NoNodesAvailable`] only when the configured node set is
    /// empty.
    pub(crate) async fn pick(&self) -> Result<Arc<NsqdInstance>, NoNodesAvailable> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(NoNodesAvailable);
        }
        if nodes.len() == 1 {
            return Ok(Arc::clone(&nodes[0]));
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % nodes.len();
        for offset in 0..nodes.len() {
            let candidate = &nodes[(start + offset) % nodes.len()];
            if candidate.is_healthy().await {
                return Ok(Arc::clone(candidate));
            }
        }

        // All nodes are unhealthy: fall back to the least-recently-failed one
        let mut least_recent = &nodes[0];
        let mut least_recent_ago = least_recent.failed_ago().await;
        for candidate in &nodes[1..] {
            let ago = candidate.failed_ago().await;
            if ago > least_recent_ago {
                least_recent = candidate;
                least_recent_ago = ago;
            }
        }
        Ok(Arc::clone(least_recent))
    }

    /// Pick a node other than `exclude`, for the single-publish retry path
    pub(crate) async fn pick_excluding(
        &self,
        exclude: &HostAndPort,
    ) -> Result<Arc<NsqdInstance>, NoNodesAvailable> {
        let nodes = self.nodes.read().await;
        let others: Vec<_> = nodes.iter().filter(|n| n.addr() != exclude).collect();
        if others.is_empty() {
            drop(nodes);
            return self.pick().await;
        }

        for candidate in &others {
            if candidate.is_healthy().await {
                return Ok(Arc::clone(candidate));
            }
        }
        Ok(Arc::clone(others[0]))
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok};

    use super::BalanceStrategy;
    use crate::host_port::HostAndPort;

    #[tokio::test]
    async fn empty_node_set_errors() {
        let strategy = BalanceStrategy::new(Vec::new());
        assert_err!(strategy.pick().await);
    }

    #[tokio::test]
    async fn single_node_is_trivial() {
        let addr = HostAndPort::new("a", 1);
        let strategy = BalanceStrategy::new(vec![addr.clone()]);
        let picked = assert_ok!(strategy.pick().await);
        assert_eq!(&addr, picked.addr());
    }

    #[tokio::test]
    async fn round_robin_across_healthy_nodes() {
        let a = HostAndPort::new("a", 1);
        let b = HostAndPort::new("b", 2);
        let strategy = BalanceStrategy::new(vec![a.clone(), b.clone()]);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let picked = assert_ok!(strategy.pick().await);
            seen.insert(picked.addr().clone());
        }
        assert_eq!(2, seen.len());
    }

    #[tokio::test]
    async fn unhealthy_node_is_skipped_until_all_are_unhealthy() {
        let a = HostAndPort::new("a", 1);
        let b = HostAndPort::new("b", 2);
        let strategy = BalanceStrategy::new(vec![a.clone(), b.clone()]);

        {
            let nodes = strategy.nodes.read().await;
            nodes[0].mark_failure().await;
        }

        for _ in 0..4 {
            let picked = assert_ok!(strategy.pick().await);
            assert_eq!(&b, picked.addr());
        }

        {
            let nodes = strategy.nodes.read().await;
            nodes[1].mark_failure().await;
        }
        // both unhealthy: still returns a node rather than failing
        assert_ok!(strategy.pick().await);
    }
}
