use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ironswarm_metrics::{Counter, MetricsCore};
use ironswarm_proto::VolumeModel;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{datapool::Datapool, journey::Journey, peer_registry::PeerRegistry, runner::RunnerPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacerState {
    Scheduled,
    Running,
    Draining,
    Stopped,
}

/// Per-journey rate engine: integrates the volume model into a credit
/// accumulator on a fixed tick and launches journey runs as credit allows.
pub(crate) struct Pacer {
    journey: Arc<dyn Journey>,
    pool: Option<Arc<Datapool>>,
    volume: VolumeModel,
    start_delay: Duration,
    tick: Duration,
    drain_timeout: Duration,
    registry: Arc<PeerRegistry>,
    runner: Arc<RunnerPool>,
    backpressure: Counter,
    state: Mutex<PacerState>,
    // External stop signal; moves the pacer into Draining.
    drain: CancellationToken,
    // Force-cancels in-flight runs once the drain deadline passes.
    cancel_runs: CancellationToken,
    in_flight: Arc<AtomicU64>,
}

impl Pacer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        journey: Arc<dyn Journey>,
        pool: Option<Arc<Datapool>>,
        volume: VolumeModel,
        start_delay: Duration,
        tick: Duration,
        drain_timeout: Duration,
        registry: Arc<PeerRegistry>,
        runner: Arc<RunnerPool>,
        metrics: &MetricsCore,
    ) -> Arc<Self> {
        let backpressure =
            metrics.counter("journey_backpressure_total", &[("name", journey.name())]);
        Arc::new(Self {
            journey,
            pool,
            volume,
            start_delay,
            tick,
            drain_timeout,
            registry,
            runner,
            backpressure,
            state: Mutex::new(PacerState::Scheduled),
            drain: CancellationToken::new(),
            cancel_runs: CancellationToken::new(),
            in_flight: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn state(&self) -> PacerState {
        *self.state.lock()
    }

    pub fn journey_name(&self) -> &str {
        self.journey.name()
    }

    /// Asks the pacer to stop issuing journeys and drain.
    pub fn request_drain(&self) {
        self.drain.cancel();
    }

    fn set_state(&self, new: PacerState) {
        let mut g = self.state.lock();
        trace!(from = ?*g, to = ?new, "pacer state change");
        *g = new;
    }

    fn instantaneous_rate(&self, t_eff: Duration) -> f64 {
        let n = self.registry.n_alive() as f64;
        let ramp = if self.volume.ramp_s > 0. {
            (t_eff.as_secs_f64() / self.volume.ramp_s).min(1.)
        } else {
            1.
        };
        self.volume.target_rps / n * ramp
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut interval = tokio::time::interval(self.tick);
        let duration = Duration::from_secs_f64(self.volume.duration_s);
        let mut credit = 0f64;

        loop {
            tokio::select! {
                _ = self.drain.cancelled() => break,
                _ = interval.tick() => {}
            }

            let t = started.elapsed();
            if t < self.start_delay {
                continue;
            }
            if self.state() == PacerState::Scheduled {
                self.set_state(PacerState::Running);
            }
            let t_eff = t - self.start_delay;
            if t_eff >= duration {
                break;
            }

            // The alive-set size is re-read every tick; credit is never
            // reset when it changes.
            credit += self.instantaneous_rate(t_eff) * self.tick.as_secs_f64();
            while credit >= 1. {
                credit -= 1.;
                let launched = self.runner.try_launch(
                    self.journey.clone(),
                    self.pool.clone(),
                    self.cancel_runs.clone(),
                    self.in_flight.clone(),
                );
                if launched.is_err() {
                    // The credit is lost, not refunded.
                    self.backpressure.inc();
                }
            }
        }

        self.drain_phase().await;
        Ok(())
    }

    async fn drain_phase(&self) {
        self.set_state(PacerState::Draining);
        debug!(
            journey = %self.journey.name(),
            in_flight = self.in_flight.load(Ordering::SeqCst),
            "draining"
        );
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            if Instant::now() >= deadline {
                debug!(journey = %self.journey.name(), "drain timeout, cancelling runs");
                self.cancel_runs.cancel();
                // Cancellation aborts runs at their next await point; give
                // them a moment to unwind before declaring the pacer done.
                while self.in_flight.load(Ordering::SeqCst) != 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Some(pool) = &self.pool {
            pool.close();
        }
        self.set_state(PacerState::Stopped);
    }
}
