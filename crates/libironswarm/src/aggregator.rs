use std::{collections::HashSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use ironswarm_core::{Id16, NodeId};
use ironswarm_metrics::{Snapshot, merge};
use ironswarm_proto::SnapshotResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// The result of a cluster-wide snapshot request. Always produced by the
/// deadline; `partial` is true when some alive peers did not respond in
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub snapshot: Snapshot,
    pub partial: bool,
    pub missing: Vec<NodeId>,
}

/// Collects SNAPSHOT_RESP frames for in-flight aggregate requests.
pub(crate) struct Aggregator {
    pending: DashMap<Id16, mpsc::UnboundedSender<Snapshot>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub fn on_response(&self, resp: SnapshotResponse) {
        match self.pending.get(&resp.request_id) {
            Some(tx) => {
                let _ = tx.send(resp.snapshot);
            }
            None => {
                debug!(request = ?resp.request_id, "late snapshot response dropped");
            }
        }
    }

    /// Merges the local snapshot with everything peers send back before the
    /// deadline. `fan_out` is invoked once the collection channel is
    /// registered; it is expected to gossip the SnapshotPing.
    pub async fn aggregate(
        &self,
        request_id: Id16,
        local: Snapshot,
        expected: Arc<Vec<crate::peer_registry::AliveEntry>>,
        deadline: Duration,
        fan_out: impl FnOnce(),
    ) -> ClusterSnapshot {
        let expected: HashSet<NodeId> = expected.iter().map(|e| e.id).collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(request_id, tx);
        fan_out();

        let mut merged = local;
        let mut responded: HashSet<NodeId> = HashSet::new();
        let collect = async {
            while responded.len() < expected.len() {
                let snapshot = match rx.recv().await {
                    Some(s) => s,
                    None => break,
                };
                if !expected.contains(&snapshot.node_id) || !responded.insert(snapshot.node_id) {
                    continue;
                }
                merged = merge(merged.clone(), &snapshot);
            }
        };
        // Partial aggregates are returned at the deadline, never retried.
        let _ = tokio::time::timeout(deadline, collect).await;
        self.pending.remove(&request_id);

        let mut missing: Vec<NodeId> = expected.difference(&responded).copied().collect();
        missing.sort();
        ClusterSnapshot {
            snapshot: merged,
            partial: !missing.is_empty(),
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peer_registry::PeerRegistry, transport::WriterRequest};
    use ironswarm_core::{generate_node_id, generate_request_id};
    use ironswarm_metrics::MetricsCore;

    fn alive_entries(registry: &PeerRegistry, n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|i| {
                let id = generate_node_id();
                let (tx, _rx) = tokio::sync::mpsc::channel::<WriterRequest>(4);
                registry.session_established(id, ([127, 0, 0, 1], 9000 + i as u16).into(), tx);
                id
            })
            .collect()
    }

    fn snapshot_of(id: NodeId, value: u64) -> Snapshot {
        let m = MetricsCore::new();
        m.counter("requests", &[]).add(value);
        m.snapshot(id)
    }

    async fn run_aggregate(
        agg: Arc<Aggregator>,
        registry: &PeerRegistry,
        request_id: Id16,
        deadline: Duration,
        responses: Vec<SnapshotResponse>,
    ) -> ClusterSnapshot {
        let local = snapshot_of(registry.self_id(), 10);
        let expected = registry.alive_snapshot();
        let task = {
            let agg = agg.clone();
            tokio::spawn(
                async move { agg.aggregate(request_id, local, expected, deadline, || {}).await },
            )
        };
        // Let the aggregate task register its collection channel before the
        // responses land.
        tokio::task::yield_now().await;
        for resp in responses {
            agg.on_response(resp);
        }
        task.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_aggregate_reports_missing() {
        let registry = PeerRegistry::new(generate_node_id(), 16);
        let ids = alive_entries(&registry, 3);
        let agg = Arc::new(Aggregator::new());
        let request_id = generate_request_id();

        // Two of three respond.
        let result = run_aggregate(
            agg,
            &registry,
            request_id,
            Duration::from_secs(2),
            vec![
                SnapshotResponse {
                    request_id,
                    snapshot: snapshot_of(ids[0], 5),
                },
                SnapshotResponse {
                    request_id,
                    snapshot: snapshot_of(ids[1], 7),
                },
            ],
        )
        .await;

        assert!(result.partial);
        assert_eq!(result.missing, vec![ids[2]]);
        assert_eq!(result.snapshot.counter_value("requests", &[]), 22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_aggregate_returns_before_deadline() {
        let registry = PeerRegistry::new(generate_node_id(), 16);
        let ids = alive_entries(&registry, 1);
        let agg = Arc::new(Aggregator::new());
        let request_id = generate_request_id();

        let started = tokio::time::Instant::now();
        let result = run_aggregate(
            agg,
            &registry,
            request_id,
            Duration::from_secs(2),
            vec![SnapshotResponse {
                request_id,
                snapshot: snapshot_of(ids[0], 2),
            }],
        )
        .await;
        assert!(!result.partial);
        assert!(result.missing.is_empty());
        assert_eq!(result.snapshot.counter_value("requests", &[]), 12);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_responder_is_ignored() {
        let registry = PeerRegistry::new(generate_node_id(), 16);
        let _ids = alive_entries(&registry, 1);
        let agg = Arc::new(Aggregator::new());
        let request_id = generate_request_id();
        let result = run_aggregate(
            agg,
            &registry,
            request_id,
            Duration::from_millis(50),
            vec![SnapshotResponse {
                request_id,
                snapshot: snapshot_of(generate_node_id(), 100),
            }],
        )
        .await;
        assert!(result.partial);
        assert_eq!(result.snapshot.counter_value("requests", &[]), 10);
    }
}
