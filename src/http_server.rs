//! HTTP server implementation using Axum.

use crate::state::{AppState, Session, SessionState};
use crate::stream::StreamEvent;
use crate::viewer::{self, ViewerTarget};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    owner_key: String,
    state: SessionState,
    sandbox_id: Option<String>,
    age_secs: u64,
    idle_secs: u64,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let now = Utc::now();
        Self {
            id: session.id.clone(),
            owner_key: session.owner_key.clone(),
            state: session.state,
            sandbox_id: session.sandbox.as_ref().map(|s| s.id.clone()),
            age_secs: (now - session.created_at).num_seconds().max(0) as u64,
            idle_secs: session.idle_for(now).as_secs(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/health", get(health))
        .route("/sandbox-view/:id", get(sandbox_view))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn run_server(
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await
}

/// Caller identity: first `X-Forwarded-For` hop, else the peer address.
fn owner_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_sse(event: StreamEvent) -> Result<Event, Infallible> {
    Ok(match event {
        // SSE framing cannot carry bare carriage returns.
        StreamEvent::Data(line) => Event::default().data(line.replace('\r', "")),
        StreamEvent::Close => Event::default().event("close").data("end"),
    })
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn start(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    if payload.get("task").is_none() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "payload must be a JSON object with a \"task\" field",
        ));
    }
    let owner = owner_key(&headers, peer.map(|ConnectInfo(addr)| addr));
    info!(owner = %owner, "POST /start");

    let events = state.broker.start(owner, payload);
    Ok(Sse::new(ReceiverStream::new(events).map(to_sse)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn sandbox_view(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.broker.viewer_session(&id).await {
        Ok(Some(session)) => {
            let Some(sandbox) = &session.sandbox else {
                return json_error(StatusCode::NOT_FOUND, "Session not found or expired");
            };
            let config = state.broker.config();
            Html(viewer::render(&ViewerTarget {
                session_id: &session.id,
                host: &config.public_host,
                display_port: sandbox.endpoints.display_port,
                password: &config.vnc_password,
            }))
            .into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Session not found or expired"),
        Err(e) => {
            error!(session_id = %id, "Viewer lookup failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionInfo>>, (StatusCode, String)> {
    let sessions = state
        .broker
        .store()
        .list()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(sessions.iter().map(SessionInfo::from).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = state
        .broker
        .store()
        .get(&id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Session not found".to_string()))?;
    Ok(Json(SessionInfo::from(&session)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.broker.teardown(&id).await {
        Ok(true) => {
            info!("Deleted session: {}", id);
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => Err((StatusCode::NOT_FOUND, "Session not found".to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
