//!
//! This crate is the engine of the ironswarm distributed load generator: a
//! peer-to-peer cluster of symmetric nodes driving HTTP traffic at a
//! configured aggregate rate while aggregating latency, throughput and
//! error telemetry.
//!
//! # Quick usage example
//!
//! ```no_run
//! use libironswarm::{Node, NodeOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node = Node::new(NodeOptions::default()).await?;
//! let cluster = node.cluster_view();
//! println!("we are {:?} with {} peers", cluster.self_node.id, cluster.peers.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Overview
//! The main type to start off with is [`Node`]. The [`api::Api`] facade
//! wraps a node with serializable inputs and outputs for web frameworks and
//! the dashboard.

pub mod api;
mod aggregator;
mod config;
mod datapool;
mod gossip;
#[cfg(feature = "http-api")]
pub mod http_api;
pub mod journey;
mod listen;
#[cfg(feature = "tracing-subscriber-utils")]
pub mod logging;
mod node;
mod pacer;
mod peer_registry;
mod runner;
mod scenario;
mod transport;

pub use aggregator::ClusterSnapshot;
pub use api::{Api, ClusterView, MetricsScope, NodeView, PushEvent};
pub use config::{DEFAULT_PORT, NodeOptions};
pub use datapool::Datapool;
pub use listen::BindMode;
pub use node::Node;
pub use pacer::PacerState;
pub use peer_registry::PeerView;
pub use scenario::{JourneyStatus, ScenarioStatus, StartOutcome};

pub use ironswarm_core::{NodeId, ScenarioId, generate_scenario_id};
pub use ironswarm_metrics::Snapshot;
pub use ironswarm_proto::{
    DatapoolSpec, HttpStep, JourneySpec, ScenarioSpec, VolumeModel,
};

#[cfg(test)]
mod tests;

/// The cargo version of libironswarm.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
