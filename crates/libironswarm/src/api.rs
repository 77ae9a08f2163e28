use std::net::SocketAddr;
use std::sync::Arc;

use ironswarm_core::{NodeId, ScenarioId};
use ironswarm_metrics::Snapshot;
use ironswarm_proto::ScenarioSpec;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    aggregator::ClusterSnapshot, node::Node, peer_registry::PeerView, scenario::ScenarioStatus,
};

pub type Result<T> = anyhow::Result<T>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsScope {
    Local,
    Cluster,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub started_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    #[serde(rename = "self")]
    pub self_node: NodeView,
    pub peers: Vec<PeerView>,
}

/// Events pushed to the dashboard at 1 Hz.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    ClusterUpdate { cluster: ClusterView },
    MetricsUpdate { snapshot: Snapshot },
    ScenariosUpdate { scenarios: Vec<ScenarioStatus> },
}

/// The surface the dashboard subsystem (and any other embedder) talks to.
/// All inputs and outputs are serializable.
#[derive(Clone)]
pub struct Api {
    node: Arc<Node>,
}

impl Api {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn get_cluster(&self) -> ClusterView {
        self.node.cluster_view()
    }

    pub async fn get_metrics(&self, scope: MetricsScope) -> Result<ClusterSnapshot> {
        match scope {
            MetricsScope::Local => Ok(ClusterSnapshot {
                snapshot: self.node.local_snapshot()?,
                partial: false,
                missing: Vec::new(),
            }),
            MetricsScope::Cluster => self.node.cluster_snapshot().await,
        }
    }

    pub fn start_scenario(&self, spec: ScenarioSpec) -> Result<ScenarioId> {
        let id = spec.scenario_id;
        self.node.start_scenario(spec)?;
        Ok(id)
    }

    pub fn stop_scenario(&self, id: ScenarioId) {
        self.node.stop_scenario(id)
    }

    pub fn list_scenarios(&self) -> Vec<ScenarioStatus> {
        self.node.list_scenarios()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.node.subscribe()
    }
}
