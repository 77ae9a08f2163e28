use std::time::{Duration, Instant};

use async_trait::async_trait;
use ironswarm_proto::{HttpStep, JourneySpec};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Context handed to every journey run. Carries the shared HTTP client and
/// the cancellation token the journey is expected to honor at its next
/// yield point.
pub struct JourneyCtx {
    pub cancel: CancellationToken,
    pub http: reqwest::Client,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The request completed with an HTTP status; `status_class` is "2xx",
    /// "4xx" etc.
    Ok { status_class: &'static str },
    /// The request failed below HTTP: timeout, connect error, broken body.
    Error { kind: String },
}

#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub label: String,
    pub duration: Duration,
    pub status: OutcomeStatus,
}

/// One user journey: executes a single iteration given an optional datapool
/// row, yielding labeled request outcomes. Implementations must be cheap to
/// share; one instance serves all concurrent runs of the journey.
#[async_trait]
pub trait Journey: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run(&self, row: Option<&str>, ctx: &JourneyCtx) -> anyhow::Result<Vec<RequestOutcome>>;
}

pub(crate) fn status_class(code: u16) -> &'static str {
    match code / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "unknown",
    }
}

fn substitute(template: &str, row: Option<&str>) -> String {
    match row {
        Some(row) => template.replace("{row}", row),
        None => template.to_owned(),
    }
}

/// The declarative journey the CLI and gossiped scenario specs construct:
/// a fixed sequence of HTTP requests with `{row}` substitution.
pub struct HttpJourney {
    name: String,
    steps: Vec<HttpStep>,
}

impl HttpJourney {
    pub fn new(spec: &JourneySpec) -> Self {
        Self {
            name: spec.name.clone(),
            steps: spec.steps.clone(),
        }
    }

    async fn execute_step(
        &self,
        step: &HttpStep,
        row: Option<&str>,
        ctx: &JourneyCtx,
    ) -> OutcomeStatus {
        let method = match reqwest::Method::from_bytes(step.method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return OutcomeStatus::Error {
                    kind: "bad_method".to_owned(),
                };
            }
        };
        let timeout = step
            .timeout_s
            .map(Duration::from_secs_f64)
            .unwrap_or(ctx.request_timeout);
        let mut req = ctx
            .http
            .request(method, substitute(&step.url, row))
            .timeout(timeout);
        if let Some(body) = &step.body {
            req = req.body(substitute(body, row));
        }
        match req.send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                // Drain the body so the measured duration covers the full
                // exchange.
                let _ = resp.bytes().await;
                OutcomeStatus::Ok {
                    status_class: status_class(code),
                }
            }
            Err(e) => OutcomeStatus::Error {
                kind: classify_reqwest_error(&e),
            },
        }
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else if e.is_body() || e.is_decode() {
        "body"
    } else {
        "request"
    }
    .to_owned()
}

#[async_trait]
impl Journey for HttpJourney {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, row: Option<&str>, ctx: &JourneyCtx) -> anyhow::Result<Vec<RequestOutcome>> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            // Cooperative cancellation between steps; in-flight requests are
            // aborted at the connection level by the runner dropping us.
            if ctx.cancel.is_cancelled() {
                trace!(journey = %self.name, "cancelled mid-journey");
                break;
            }
            let started = Instant::now();
            let status = self.execute_step(step, row, ctx).await;
            outcomes.push(RequestOutcome {
                label: step.label.clone(),
                duration: started.elapsed(),
                status,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(299), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
        assert_eq!(status_class(999), "unknown");
    }

    #[test]
    fn test_substitute() {
        assert_eq!(
            substitute("http://x/{row}/get", Some("abc")),
            "http://x/abc/get"
        );
        assert_eq!(substitute("http://x/{row}", None), "http://x/{row}");
        assert_eq!(substitute("http://x/plain", Some("abc")), "http://x/plain");
    }
}
