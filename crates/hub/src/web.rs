use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::commands::{CommandError, CommandRequest, Publish};
use crate::hub::Hub;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        let msg = e.to_string();
        match e {
            CommandError::MissingIdentity => Self::BadRequest(msg),
            CommandError::NotFound => Self::NotFound(msg),
            CommandError::Store(inner) => Self::Internal(inner),
            CommandError::Publish(msg) => Self::Internal(anyhow::anyhow!("publish failed: {msg}")),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rej: QueryRejection) -> Self {
        Self::BadRequest(rej.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        Self::BadRequest(rej.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(e) => {
                error!("request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };
        (status, Json(ErrorBody { ok: false, error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<P: Publish + 'static>(hub: Arc<Hub<P>>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<P>))
        .route("/api/devices", get(list_devices::<P>))
        .route("/api/devices/command", post(device_command::<P>))
        .route("/api/devices/history", get(action_history::<P>))
        .route("/api/readings", get(readings::<P>))
        .route("/api/readings/latest", get(latest_reading::<P>))
        .route("/api/readings/stats", get(daily_stats::<P>))
        .route("/api/events", get(live_events::<P>))
        .with_state(hub)
}

async fn api_status<P: Publish>(State(hub): State<Arc<Hub<P>>>) -> impl IntoResponse {
    Json(hub.status().await)
}

async fn list_devices<P: Publish>(State(hub): State<Arc<Hub<P>>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(hub.list_devices().await?))
}

async fn device_command<P: Publish>(
    State(hub): State<Arc<Hub<P>>>,
    body: std::result::Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let req = CommandRequest::from_map(&body).map_err(ApiError::BadRequest)?;
    let receipt = hub.request_device_command(req).await?;
    Ok(Json(json!({ "ok": true, "info": receipt })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn action_history<P: Publish>(
    State(hub): State<Arc<Hub<P>>>,
    query: std::result::Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(q) = query?;
    Ok(Json(hub.action_history(q.limit).await?))
}

#[derive(Deserialize)]
struct ReadingsQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

async fn readings<P: Publish>(
    State(hub): State<Arc<Hub<P>>>,
    query: std::result::Result<Query<ReadingsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(q) = query?;
    if let (Some(from), Some(to)) = (q.from, q.to) {
        if from > to {
            return Err(ApiError::BadRequest("'from' is after 'to'".to_string()));
        }
    }
    Ok(Json(hub.readings(q.from, q.to, q.limit).await?))
}

async fn latest_reading<P: Publish>(State(hub): State<Arc<Hub<P>>>) -> ApiResult<impl IntoResponse> {
    let body = match hub.latest_reading().await? {
        Some(r) => serde_json::to_value(r).context("serialize reading")?,
        None => json!({}),
    };
    Ok(Json(body))
}

#[derive(Deserialize)]
struct StatsQuery {
    date: Option<NaiveDate>,
}

async fn daily_stats<P: Publish>(
    State(hub): State<Arc<Hub<P>>>,
    query: std::result::Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(q) = query?;
    Ok(Json(hub.daily_stats(q.date).await?))
}

/// `reading.created` / `device.updated` frames for as long as the client
/// stays connected. No replay of earlier events.
async fn live_events<P: Publish>(
    State(hub): State<Arc<Hub<P>>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = hub.subscribe();
    debug!(clients = hub.live_clients(), "live client connected");
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(ev) => match ev.data_json() {
            Ok(data) => Some(Ok(Event::default().event(ev.name()).data(data))),
            Err(e) => {
                warn!("failed to encode live event: {e}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            warn!(skipped = n, "live client lagged, events dropped");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<P: Publish + 'static>(
    hub: Arc<Hub<P>>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
