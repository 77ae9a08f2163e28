use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace};

const HEARTBEAT: Duration = Duration::from_secs(5);

/// Spawns an instrumented task. Long-lived loops (session readers, pacer
/// ticks, gossip timers) report a heartbeat with their age so a wedged one
/// shows up in trace logs; a task that returns an error logs it and dies
/// without taking anything else down.
#[track_caller]
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        let started = Instant::now();
        trace!("started");
        tokio::pin!(fut);
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.reset();
        let result = loop {
            tokio::select! {
                r = &mut fut => break r,
                _ = heartbeat.tick() => {
                    trace!(age_s = started.elapsed().as_secs(), "still running");
                }
            }
        };
        match result {
            Ok(()) => trace!(age_s = started.elapsed().as_secs(), "finished"),
            Err(e) => error!("finished with error: {e:#}"),
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

/// Like [`spawn`], but the future is abandoned when `cancel` fires. Node
/// shutdown and scenario teardown stop their whole task trees through one
/// token; cancellation is a normal exit, not an error.
#[track_caller]
pub fn spawn_with_cancel(
    span: tracing::Span,
    cancel: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("task cancelled");
                Ok(())
            }
            r = fut => r,
        }
    })
}
