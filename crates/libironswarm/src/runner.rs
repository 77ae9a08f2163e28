use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ironswarm_core::spawn_utils::spawn;
use ironswarm_metrics::MetricsCore;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use crate::{
    datapool::Datapool,
    journey::{Journey, JourneyCtx, OutcomeStatus},
};

/// The runner pool is saturated; the launch is lost, never queued.
#[derive(Debug)]
pub(crate) struct Saturated;

/// Cooperative worker pool executing journey runs, bounded by
/// `max_in_flight_journeys` semaphore permits across all scenarios.
pub(crate) struct RunnerPool {
    sem: Arc<Semaphore>,
    metrics: Arc<MetricsCore>,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl RunnerPool {
    pub fn new(
        metrics: Arc<MetricsCore>,
        max_in_flight: usize,
        http: reqwest::Client,
        request_timeout: Duration,
    ) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_in_flight)),
            metrics,
            http,
            request_timeout,
        }
    }

    /// Attempts to start one journey run. Fails immediately when no permit
    /// is available; runs are independent and failures are counted, not
    /// propagated.
    pub fn try_launch(
        &self,
        journey: Arc<dyn Journey>,
        pool: Option<Arc<Datapool>>,
        cancel: CancellationToken,
        in_flight: Arc<AtomicU64>,
    ) -> Result<(), Saturated> {
        let permit = match self.sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return Err(Saturated),
        };
        in_flight.fetch_add(1, Ordering::SeqCst);
        let ctx = JourneyCtx {
            cancel,
            http: self.http.clone(),
            request_timeout: self.request_timeout,
        };
        let metrics = self.metrics.clone();
        spawn(debug_span!("journey", name = %journey.name()), async move {
            let _permit = permit;
            run_one(&*journey, pool.as_deref(), &ctx, &metrics).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    }
}

async fn run_one(
    journey: &dyn Journey,
    pool: Option<&Datapool>,
    ctx: &JourneyCtx,
    metrics: &MetricsCore,
) {
    let name = journey.name();
    let row = match pool {
        Some(pool) => match pool.next_row().await {
            Some(row) => Some(row),
            None => {
                trace!("datapool exhausted, skipping scheduled start");
                metrics.increment("datapool_exhausted_total", &[("journey", name)]);
                return;
            }
        },
        None => None,
    };

    // Cancellation aborts the run at the connection level: dropping the
    // journey future tears down any in-flight HTTP request.
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            metrics.increment("journey_failures_total", &[("name", name), ("kind", "cancelled")]);
            return;
        }
        r = journey.run(row.as_deref(), ctx) => r,
    };

    match result {
        Ok(outcomes) => {
            for outcome in &outcomes {
                let label = outcome.label.as_str();
                match &outcome.status {
                    OutcomeStatus::Ok { status_class } => {
                        metrics.increment(
                            "http_requests_total",
                            &[("label", label), ("status_class", status_class)],
                        );
                    }
                    OutcomeStatus::Error { kind } => {
                        metrics.increment(
                            "http_requests_total",
                            &[("label", label), ("status_class", "error")],
                        );
                        metrics
                            .increment("http_errors_total", &[("label", label), ("kind", kind)]);
                    }
                }
                metrics.observe_duration(
                    "http_request_duration_seconds",
                    &[("label", label)],
                    outcome.duration.as_secs_f64(),
                );
            }
            metrics.increment("journey_executions_total", &[("name", name)]);
        }
        Err(e) => {
            debug!("journey failed: {e:#}");
            metrics.increment(
                "journey_failures_total",
                &[("name", name), ("kind", "user_error")],
            );
        }
    }
}
