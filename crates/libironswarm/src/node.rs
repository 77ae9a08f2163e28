use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use ironswarm_core::{
    NodeId, generate_node_id, generate_request_id, rate_estimator::RateEstimator,
    spawn_utils::spawn_with_cancel,
};
use ironswarm_metrics::{MetricsCore, Snapshot, epoch_ms};
use ironswarm_proto::{
    ControlEnvelope, ControlPayload, FrameKind, GossipPayload, PingPayload, ScenarioSpec,
    SnapshotResponse,
};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error_span, info, warn};

use crate::{
    aggregator::{Aggregator, ClusterSnapshot},
    api::{ClusterView, NodeView, PushEvent},
    config::NodeOptions,
    gossip::Gossip,
    peer_registry::PeerRegistry,
    runner::RunnerPool,
    scenario::{ScenarioManager, ScenarioStatus, StartOutcome},
    transport::{FrameHandler, Transport},
};

/// One IronSwarm node: the peer listener, gossip membership, scenario
/// scheduling and metrics of a single process. Everything hangs off this.
pub struct Node {
    opts: NodeOptions,
    id: NodeId,
    started_at_epoch_ms: u64,
    metrics: Arc<MetricsCore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    gossip: Arc<Gossip>,
    scenarios: Arc<ScenarioManager>,
    aggregator: Aggregator,
    journey_rate: RateEstimator,
    push_tx: broadcast::Sender<PushEvent>,
    cancel: CancellationToken,
}

impl Node {
    /// Binds the peer listener and brings up all background tasks. A bind
    /// failure here is fatal for the process.
    pub async fn new(mut opts: NodeOptions) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(opts.listen_addr)
            .await
            .with_context(|| format!("error binding peer listener to {}", opts.listen_addr))?;
        let bound = listener.local_addr().context("error reading bound address")?;
        // An ephemeral port request needs the real port reflected in what we
        // advertise.
        opts.listen_addr = bound;
        let advertised = opts.advertise_addr.unwrap_or(bound);
        opts.advertise_addr = Some(SocketAddr::new(advertised.ip(), bound.port()));

        let id = generate_node_id();
        info!(id = ?id, addr = %opts.advertised(), "node starting");

        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsCore::with_event_capacity(opts.event_buffer_capacity));
        let registry = Arc::new(PeerRegistry::new(id, opts.max_peers));
        let transport = Arc::new(Transport::new(
            id,
            opts.clone(),
            registry.clone(),
            &metrics,
            cancel.clone(),
        ));
        let gossip = Arc::new(Gossip::new(
            registry.clone(),
            transport.clone(),
            opts.clone(),
            cancel.clone(),
        ));
        let http = reqwest::Client::builder()
            .build()
            .context("error building HTTP client")?;
        let runner = Arc::new(RunnerPool::new(
            metrics.clone(),
            opts.max_in_flight_journeys,
            http,
            opts.request_timeout,
        ));
        let scenarios = Arc::new(ScenarioManager::new(
            registry.clone(),
            runner,
            metrics.clone(),
            opts.clone(),
            cancel.clone(),
        ));
        let (push_tx, _) = broadcast::channel(64);

        let node = Arc::new(Node {
            opts,
            id,
            started_at_epoch_ms: epoch_ms(),
            metrics,
            registry,
            transport,
            gossip,
            scenarios,
            aggregator: Aggregator::new(),
            journey_rate: RateEstimator::new(5),
            push_tx,
            cancel,
        });
        node.transport
            .set_handler(Arc::downgrade(&node) as Weak<dyn FrameHandler>);
        node.start_background_tasks(listener);

        for addr in node.opts.bootstrap.clone() {
            node.transport.spawn_connect(addr, None);
        }
        Ok(node)
    }

    fn start_background_tasks(self: &Arc<Self>, listener: TcpListener) {
        spawn_with_cancel(error_span!("accept"), self.cancel.clone(), {
            let transport = self.transport.clone();
            transport.accept_loop(listener)
        });
        spawn_with_cancel(
            error_span!("gossip"),
            self.cancel.clone(),
            self.gossip.clone().run_exchange_loop(),
        );

        spawn_with_cancel(error_span!("liveness"), self.cancel.clone(), {
            let weak = Arc::downgrade(self);
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    let node = weak.upgrade().context("node is dead")?;
                    let orders = node.registry.liveness_tick(
                        node.opts.ping_interval,
                        node.opts.ping_timeout,
                        node.opts.suspect_to_dead,
                    );
                    for order in orders {
                        let _ = node.transport.send_frame(
                            &order.tx,
                            FrameKind::Ping,
                            &PingPayload { nonce: order.nonce },
                        );
                    }
                }
            }
        });

        // Push channel + journey rate estimation, both at 1 Hz off the same
        // snapshot.
        spawn_with_cancel(debug_span!("push"), self.cancel.clone(), {
            let weak = Arc::downgrade(self);
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    let node = weak.upgrade().context("node is dead")?;
                    let snapshot = match node.local_snapshot() {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("metrics snapshot failed: {e:#}");
                            continue;
                        }
                    };
                    node.journey_rate.add_snapshot(
                        snapshot.counter_total("journey_executions_total"),
                        std::time::Instant::now(),
                    );
                    if node.push_tx.receiver_count() > 0 {
                        let _ = node.push_tx.send(PushEvent::ClusterUpdate {
                            cluster: node.cluster_view(),
                        });
                        let _ = node.push_tx.send(PushEvent::MetricsUpdate { snapshot });
                        let _ = node.push_tx.send(PushEvent::ScenariosUpdate {
                            scenarios: node.list_scenarios(),
                        });
                    }
                }
            }
        });
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.opts.advertised()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.opts
    }

    pub fn metrics(&self) -> &Arc<MetricsCore> {
        &self.metrics
    }

    /// Journey executions per second over the last few seconds.
    pub fn journeys_per_second(&self) -> f64 {
        self.journey_rate.per_second()
    }

    pub fn cluster_view(&self) -> ClusterView {
        ClusterView {
            self_node: NodeView {
                id: self.id,
                addr: self.advertised_addr(),
                started_at_epoch_ms: self.started_at_epoch_ms,
            },
            peers: self.registry.peer_views(),
        }
    }

    /// The local metrics snapshot. A corrupt registry here is fatal by
    /// design; the caller decides how to die.
    pub fn local_snapshot(&self) -> anyhow::Result<Snapshot> {
        let snapshot = self.metrics.snapshot(self.id);
        snapshot
            .validate()
            .context("metrics registry invariant broken")?;
        Ok(snapshot)
    }

    /// Cluster-wide snapshot: local capture, SnapshotPing fan-out over
    /// gossip, merge of everything received by the deadline. Always returns
    /// by the deadline with a truthful `partial` flag.
    pub async fn cluster_snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        let local = self.local_snapshot()?;
        let request_id = generate_request_id();
        let expected = self.registry.alive_snapshot();
        let result = self
            .aggregator
            .aggregate(
                request_id,
                local,
                expected,
                self.opts.snapshot_timeout,
                || {
                    self.gossip.broadcast(ControlPayload::SnapshotPing {
                        request_id,
                        requester: self.id,
                        requester_addr: self.advertised_addr(),
                    });
                },
            )
            .await;
        Ok(result)
    }

    /// Starts a scenario originating on this node and announces it to the
    /// cluster.
    pub fn start_scenario(&self, spec: ScenarioSpec) -> anyhow::Result<StartOutcome> {
        let outcome = self.scenarios.start_scenario(spec.clone())?;
        if outcome == StartOutcome::Started {
            self.gossip
                .broadcast(ControlPayload::ScenarioStart { scenario: spec });
        }
        Ok(outcome)
    }

    pub fn stop_scenario(&self, id: ironswarm_core::ScenarioId) {
        self.scenarios.stop_scenario(id);
        self.gossip
            .broadcast(ControlPayload::ScenarioStop { scenario_id: id });
    }

    pub fn list_scenarios(&self) -> Vec<ScenarioStatus> {
        self.scenarios.list()
    }

    pub fn scenario_count(&self) -> usize {
        self.scenarios.count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.push_tx.subscribe()
    }

    /// Graceful shutdown: drain scenarios, say BYE, stop all tasks.
    pub async fn shutdown(&self) {
        info!("node shutting down");
        self.scenarios.stop_all();
        self.transport.broadcast_bye();
        // Give session writers a moment to flush the BYEs.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.cancel.cancel();
    }
}

#[async_trait]
impl FrameHandler for Node {
    async fn on_gossip(&self, from: NodeId, payload: GossipPayload) {
        self.gossip.on_gossip(from, payload);
    }

    async fn on_control(&self, from: NodeId, envelope: ControlEnvelope) {
        let Some(payload) = self.gossip.accept(from, envelope) else {
            return;
        };
        match payload {
            ControlPayload::ScenarioStart { scenario } => {
                if let Err(e) = self.scenarios.start_scenario(scenario) {
                    warn!("rejecting gossiped scenario: {e:#}");
                }
            }
            ControlPayload::ScenarioStop { scenario_id } => {
                self.scenarios.stop_scenario(scenario_id);
            }
            ControlPayload::SnapshotPing {
                request_id,
                requester,
                requester_addr,
            } => {
                if requester == self.id {
                    return;
                }
                let snapshot = match self.local_snapshot() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("cannot answer snapshot ping: {e:#}");
                        return;
                    }
                };
                let sent = self.transport.send_to_peer(
                    requester,
                    Some(requester_addr),
                    FrameKind::SnapshotResp,
                    &SnapshotResponse {
                        request_id,
                        snapshot,
                    },
                );
                if let Err(e) = sent {
                    debug!(requester = ?requester, "snapshot reply failed: {e:#}");
                }
            }
        }
    }

    fn local_snapshot(&self) -> anyhow::Result<Snapshot> {
        Node::local_snapshot(self)
    }

    fn on_snapshot_response(&self, response: SnapshotResponse) {
        self.aggregator.on_response(response);
    }
}
