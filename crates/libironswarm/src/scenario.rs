use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use ironswarm_core::{ScenarioId, spawn_utils::spawn_with_cancel};
use ironswarm_metrics::{MetricsCore, epoch_ms};
use ironswarm_proto::ScenarioSpec;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info};

use crate::{
    config::NodeOptions,
    datapool::Datapool,
    journey::HttpJourney,
    pacer::{Pacer, PacerState},
    peer_registry::PeerRegistry,
    runner::RunnerPool,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The id is already active; starts are idempotent and this is not an
    /// error.
    DuplicateId,
}

pub(crate) struct ManagedScenario {
    pub spec: ScenarioSpec,
    pub started_at_epoch_ms: u64,
    pacers: Vec<Arc<Pacer>>,
}

impl ManagedScenario {
    fn drain(&self) {
        for p in &self.pacers {
            p.request_drain();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JourneyStatus {
    pub name: String,
    pub state: PacerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStatus {
    pub id: ScenarioId,
    pub started_at_epoch_ms: u64,
    pub journeys: Vec<JourneyStatus>,
}

/// Owns the set of active scenarios on this node, regardless of whether
/// they arrived from the local CLI, the dashboard, or gossip.
pub(crate) struct ScenarioManager {
    scenarios: RwLock<HashMap<ScenarioId, Arc<ManagedScenario>>>,
    // Stops that arrived before their start; applied if the start shows up
    // within the tombstone window.
    tombstones: Mutex<HashMap<ScenarioId, Instant>>,
    registry: Arc<PeerRegistry>,
    runner: Arc<RunnerPool>,
    metrics: Arc<MetricsCore>,
    opts: NodeOptions,
    cancel: CancellationToken,
}

impl ScenarioManager {
    pub fn new(
        registry: Arc<PeerRegistry>,
        runner: Arc<RunnerPool>,
        metrics: Arc<MetricsCore>,
        opts: NodeOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scenarios: Default::default(),
            tombstones: Default::default(),
            registry,
            runner,
            metrics,
            opts,
            cancel,
        }
    }

    /// Starts a scenario. Duplicate ids are accepted silently so that a
    /// locally submitted start and the same start arriving over gossip
    /// cannot race into two instances.
    pub fn start_scenario(self: &Arc<Self>, spec: ScenarioSpec) -> anyhow::Result<StartOutcome> {
        spec.validate()?;
        if spec.journeys.len() > self.opts.max_pacers_per_scenario {
            anyhow::bail!(
                "scenario has {} journeys, max is {}",
                spec.journeys.len(),
                self.opts.max_pacers_per_scenario
            );
        }

        let id = spec.scenario_id;
        let scenario = {
            let mut g = self.scenarios.write();
            if g.contains_key(&id) {
                debug!(scenario = ?id, "duplicate scenario start ignored");
                return Ok(StartOutcome::DuplicateId);
            }
            if g.len() >= self.opts.max_scenarios {
                anyhow::bail!("{} scenarios already active, max reached", g.len());
            }

            let start_delay = Duration::from_secs_f64(spec.start_delay_s);
            let mut pacers = Vec::with_capacity(spec.journeys.len());
            for journey_spec in &spec.journeys {
                let pool = journey_spec.datapool.as_ref().map(|dp| {
                    Arc::new(Datapool::build(dp, self.opts.datapool_channel_capacity))
                });
                let journey = Arc::new(HttpJourney::new(journey_spec));
                pacers.push(Pacer::new(
                    journey,
                    pool,
                    journey_spec.volume,
                    start_delay,
                    self.opts.pacer_tick,
                    self.opts.drain_timeout,
                    self.registry.clone(),
                    self.runner.clone(),
                    &self.metrics,
                ));
            }
            let scenario = Arc::new(ManagedScenario {
                spec,
                started_at_epoch_ms: epoch_ms(),
                pacers,
            });
            g.insert(id, scenario.clone());
            scenario
        };

        info!(scenario = ?id, journeys = scenario.pacers.len(), "scenario started");
        self.metrics.increment("scenarios_started_total", &[]);

        // A buffered out-of-order stop applies as soon as the start lands.
        if self.take_tombstone(&id) {
            info!(scenario = ?id, "applying buffered stop");
            scenario.drain();
        }

        // Supervisor: the scenario self-stops once every pacer reaches
        // Stopped.
        let this = self.clone();
        let pacer_handles: Vec<_> = scenario
            .pacers
            .iter()
            .map(|p| {
                spawn_with_cancel(
                    debug_span!("pacer", journey = %p.journey_name()),
                    self.cancel.clone(),
                    p.clone().run(),
                )
            })
            .collect();
        spawn_with_cancel(
            debug_span!("scenario", scenario = ?id),
            self.cancel.clone(),
            async move {
                for h in pacer_handles {
                    h.await.context("pacer task panicked")?;
                }
                this.scenarios.write().remove(&id);
                info!(scenario = ?id, "scenario finished");
                Ok(())
            },
        );

        Ok(StartOutcome::Started)
    }

    /// Stops a scenario; an unknown id is tombstoned in case its start is
    /// still in flight.
    pub fn stop_scenario(&self, id: ScenarioId) {
        let found = self.scenarios.read().get(&id).cloned();
        match found {
            Some(scenario) => {
                info!(scenario = ?id, "stopping scenario");
                scenario.drain();
            }
            None => {
                debug!(scenario = ?id, "stop for unknown scenario, tombstoning");
                self.tombstones.lock().insert(id, Instant::now());
            }
        }
    }

    fn take_tombstone(&self, id: &ScenarioId) -> bool {
        let mut g = self.tombstones.lock();
        let window = self.opts.tombstone_window;
        g.retain(|_, at| at.elapsed() < window);
        g.remove(id).is_some()
    }

    pub fn list(&self) -> Vec<ScenarioStatus> {
        let mut out: Vec<ScenarioStatus> = self
            .scenarios
            .read()
            .values()
            .map(|s| ScenarioStatus {
                id: s.spec.scenario_id,
                started_at_epoch_ms: s.started_at_epoch_ms,
                journeys: s
                    .pacers
                    .iter()
                    .map(|p| JourneyStatus {
                        name: p.journey_name().to_owned(),
                        state: p.state(),
                    })
                    .collect(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn count(&self) -> usize {
        self.scenarios.read().len()
    }

    /// Drains everything; used at shutdown.
    pub fn stop_all(&self) {
        for scenario in self.scenarios.read().values() {
            scenario.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironswarm_core::{generate_node_id, generate_scenario_id};
    use ironswarm_proto::{JourneySpec, VolumeModel};

    fn manager() -> Arc<ScenarioManager> {
        let metrics = Arc::new(MetricsCore::new());
        let registry = Arc::new(PeerRegistry::new(generate_node_id(), 16));
        let runner = Arc::new(RunnerPool::new(
            metrics.clone(),
            1024,
            reqwest::Client::new(),
            Duration::from_secs(30),
        ));
        Arc::new(ScenarioManager::new(
            registry,
            runner,
            metrics,
            NodeOptions::default(),
            CancellationToken::new(),
        ))
    }

    fn spec(id: ScenarioId, duration_s: f64) -> ScenarioSpec {
        ScenarioSpec {
            scenario_id: id,
            start_delay_s: 0.,
            journeys: vec![JourneySpec {
                name: "j".into(),
                volume: VolumeModel {
                    target_rps: 10.,
                    duration_s,
                    ramp_s: 0.,
                },
                datapool: None,
                steps: vec![],
            }],
        }
    }

    async fn wait_until_gone(m: &ScenarioManager, id: &ScenarioId) {
        while m.scenarios.read().contains_key(id) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_idempotent() {
        let m = manager();
        let id = generate_scenario_id();
        assert_eq!(
            m.start_scenario(spec(id, 3600.)).unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            m.start_scenario(spec(id, 3600.)).unwrap(),
            StartOutcome::DuplicateId
        );
        assert_eq!(m.count(), 1);
        m.stop_scenario(id);
        wait_until_gone(&m, &id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_self_stops() {
        let m = manager();
        let id = generate_scenario_id();
        m.start_scenario(spec(id, 0.5)).unwrap();
        wait_until_gone(&m, &id).await;
        assert_eq!(m.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_stop_applies_to_late_start() {
        let m = manager();
        let id = generate_scenario_id();
        m.stop_scenario(id);
        m.start_scenario(spec(id, 3600.)).unwrap();
        // The tombstone drains the scenario right away; it disappears
        // without waiting the full hour.
        wait_until_gone(&m, &id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tombstone_is_ignored() {
        let m = manager();
        let id = generate_scenario_id();
        m.stop_scenario(id);
        tokio::time::sleep(Duration::from_secs(6)).await;
        m.start_scenario(spec(id, 3600.)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(m.count(), 1, "stale tombstone must not stop the scenario");
        m.stop_scenario(id);
        wait_until_gone(&m, &id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_scenarios_cap() {
        let m = manager();
        let mut opts_hit = false;
        for _ in 0..(m.opts.max_scenarios + 1) {
            let res = m.start_scenario(spec(generate_scenario_id(), 3600.));
            if res.is_err() {
                opts_hit = true;
            }
        }
        assert!(opts_hit);
        m.stop_all();
    }
}
