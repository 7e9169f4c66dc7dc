//! Node selection for a single cluster (§4.2).
//!
//! WRITE always targets node 0 and never fails over. READ walks candidates in
//! reverse declared order (last node first) so read load is spread away from the
//! writer, probing reachability with a short TCP connect. HEALTH targets node 0 for
//! a single check, or every node for a fan-out.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::{
    config::DEFAULT_PROBE_TIMEOUT,
    errors::{Error, Result},
    net::Host,
};

/// How long a cached "unreachable" verdict is trusted before the node is re-probed.
/// Must not exceed the interval a caller would otherwise re-probe at, or sustained
/// recovery could be masked indefinitely.
const UNREACHABLE_CACHE_TTL: Duration = Duration::from_secs(5);

/// The class of operation a caller wants a node for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Read,
    Write,
    Health,
}

struct NodeState {
    host: Host,
    label: Option<String>,
    unreachable: AtomicBool,
    marked_at_unix: AtomicU64,
}

/// Stateless selection policy over a fixed, ordered node list for one cluster. The
/// only state kept is the best-effort "known unreachable" cache per node.
pub struct NodeSelector {
    cluster: String,
    nodes: Vec<NodeState>,
    probe_timeout: Duration,
}

impl NodeSelector {
    #[must_use]
    pub fn new(cluster: impl Into<String>, nodes: Vec<(Host, Option<String>)>) -> Self {
        Self {
            cluster: cluster.into(),
            nodes: nodes
                .into_iter()
                .map(|(host, label)| NodeState {
                    host,
                    label,
                    unreachable: AtomicBool::new(false),
                    marked_at_unix: AtomicU64::new(0),
                })
                .collect(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn host_at(&self, index: usize) -> Option<&Host> {
        self.nodes.get(index).map(|n| &n.host)
    }

    /// Explicitly marks a node unreachable, bypassing the TCP probe. Exposed for
    /// tests (see S3/S4) and for callers that already know a bind just failed.
    pub fn mark_unreachable(&self, index: usize) {
        if let Some(node) = self.nodes.get(index) {
            node.unreachable.store(true, Ordering::Relaxed);
            node.marked_at_unix.store(now_unix(), Ordering::Relaxed);
        }
    }

    pub fn mark_reachable(&self, index: usize) {
        if let Some(node) = self.nodes.get(index) {
            node.unreachable.store(false, Ordering::Relaxed);
        }
    }

    async fn is_reachable(&self, index: usize) -> bool {
        let Some(node) = self.nodes.get(index) else {
            return false;
        };
        if node.unreachable.load(Ordering::Relaxed) {
            let marked_at = node.marked_at_unix.load(Ordering::Relaxed);
            if now_unix().saturating_sub(marked_at) < UNREACHABLE_CACHE_TTL.as_secs() {
                return false;
            }
        }
        let reachable = probe_tcp(&node.host, self.probe_timeout).await;
        if reachable {
            node.unreachable.store(false, Ordering::Relaxed);
        } else {
            node.unreachable.store(true, Ordering::Relaxed);
            node.marked_at_unix.store(now_unix(), Ordering::Relaxed);
        }
        reachable
    }

    /// Selects a single node index for `class`. HEALTH fan-out uses
    /// [`Self::health_fan_out`] instead.
    pub async fn select(&self, class: OperationClass) -> Result<usize> {
        if self.nodes.is_empty() {
            return Err(Error::ServiceUnavailable(format!(
                "cluster '{}' has no configured nodes",
                self.cluster
            )));
        }
        match class {
            OperationClass::Write => {
                if self.is_reachable(0).await {
                    Ok(0)
                } else {
                    Err(Error::ServiceUnavailable(format!(
                        "cluster '{}' write/master node is unreachable",
                        self.cluster
                    )))
                }
            }
            OperationClass::Health => {
                if self.is_reachable(0).await {
                    Ok(0)
                } else {
                    Err(Error::ServiceUnavailable(format!(
                        "cluster '{}' master node is unreachable for health check",
                        self.cluster
                    )))
                }
            }
            OperationClass::Read => {
                for index in (0..self.nodes.len()).rev() {
                    if self.is_reachable(index).await {
                        return Ok(index);
                    }
                }
                Err(Error::ServiceUnavailable(format!(
                    "cluster '{}' has no reachable node for reads",
                    self.cluster
                )))
            }
        }
    }

    /// All node indices, for a HEALTH fan-out snapshot (used by the replication
    /// monitor, which probes every node regardless of the cached reachability bit).
    #[must_use]
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.nodes.len()).collect()
    }

    #[must_use]
    pub fn label_at(&self, index: usize) -> String {
        self.nodes
            .get(index)
            .and_then(|n| n.label.clone())
            .unwrap_or_else(|| format!("node-{index}"))
    }
}

async fn probe_tcp(host: &Host, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(host.address())).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            warn!(node = %host, error = %e, "reachability probe failed");
            false
        }
        Err(_) => {
            warn!(node = %host, "reachability probe timed out");
            false
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::{NodeSelector, OperationClass};
    use crate::net::Host;

    fn selector() -> NodeSelector {
        NodeSelector::new(
            "c1",
            vec![
                (Host::new("a", 389), Some("A".into())),
                (Host::new("b", 389), Some("B".into())),
                (Host::new("c", 389), Some("C".into())),
            ],
        )
    }

    #[tokio::test]
    async fn write_always_pins_to_node_zero_when_marked_unreachable() {
        let sel = selector();
        sel.mark_unreachable(0);
        let err = sel.select(OperationClass::Write).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn read_never_considers_unreachable_nodes_cached_bit() {
        let sel = selector();
        sel.mark_unreachable(2);
        sel.mark_unreachable(1);
        // node 0 is still real (will fail real TCP connect too, in this offline unit
        // test), so we only assert the cache short-circuits 2 and 1 without a probe
        // by checking reachability directly rather than going through a live socket.
        assert!(sel.nodes[2].unreachable.load(std::sync::atomic::Ordering::Relaxed));
        assert!(sel.nodes[1].unreachable.load(std::sync::atomic::Ordering::Relaxed));
    }
}
