use std::str::FromStr;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use ironswarm_core::ScenarioId;
use ironswarm_proto::ScenarioSpec;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{Api, MetricsScope};

struct ApiError {
    status: StatusCode,
    err: anyhow::Error,
}

impl ApiError {
    fn bad_request(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": format!("{:#}", self.err) })),
        )
            .into_response()
    }
}

type Result<T> = std::result::Result<T, ApiError>;

#[derive(Deserialize)]
struct MetricsQuery {
    scope: Option<MetricsScope>,
}

async fn get_cluster(State(api): State<Api>) -> impl IntoResponse {
    Json(api.get_cluster())
}

async fn get_metrics(
    State(api): State<Api>,
    Query(q): Query<MetricsQuery>,
) -> Result<impl IntoResponse> {
    let scope = q.scope.unwrap_or(MetricsScope::Local);
    let snapshot = api.get_metrics(scope).await?;
    Ok(Json(snapshot))
}

async fn list_scenarios(State(api): State<Api>) -> impl IntoResponse {
    Json(api.list_scenarios())
}

async fn start_scenario(
    State(api): State<Api>,
    Json(spec): Json<ScenarioSpec>,
) -> Result<impl IntoResponse> {
    let id = api.start_scenario(spec).map_err(ApiError::bad_request)?;
    Ok(Json(json!({ "scenario_id": id })))
}

async fn stop_scenario(
    State(api): State<Api>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = ScenarioId::from_str(&id)
        .context("invalid scenario id")
        .map_err(ApiError::bad_request)?;
    api.stop_scenario(id);
    Ok(Json(json!({ "stopped": id })))
}

async fn events(
    State(api): State<Api>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let rx = api.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|ev| async move {
        match ev {
            Ok(ev) => Event::default().json_data(&ev).ok().map(Ok),
            // A lagged receiver just skips ahead.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn make_router(api: Api) -> Router {
    Router::new()
        .route("/cluster", get(get_cluster))
        .route("/metrics", get(get_metrics))
        .route("/scenarios", get(list_scenarios).post(start_scenario))
        .route("/scenarios/{id}/stop", post(stop_scenario))
        .route("/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(api)
}

/// Serves the dashboard contract over HTTP: REST endpoints plus an SSE
/// stream for the 1 Hz push channel.
pub async fn serve(api: Api, listener: TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("error reading API address")?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, make_router(api).into_make_service())
        .await
        .context("error serving HTTP API")
}
