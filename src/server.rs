/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! HTTP/WebSocket control surface. Every response is an `{ok:true, …}` or
//! `{ok:false, error}` envelope; the WebSocket feed pushes the status
//! snapshot on connect and whenever the engine publishes a new one.

use crate::{
    config::ConfigPatch,
    engine::SyncEngine,
    error::{ApiError, ApiResult, LoopSyncError},
    status::{Mode, StatusSnapshot},
    timecode::Frames,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::{net::TcpListener, select, sync::watch};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, instrument};

#[derive(Clone)]
struct AppState {
    engine: Arc<SyncEngine>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

pub fn start_webserver(
    subsys: &SubsystemHandle,
    engine: Arc<SyncEngine>,
    status_rx: watch::Receiver<StatusSnapshot>,
    port: u16,
) {
    info!("Starting webserver subsystem");
    subsys.start(SubsystemBuilder::new("webserver", move |subsys| {
        webserver(subsys, engine, status_rx, port)
    }));
}

async fn webserver(
    subsys: SubsystemHandle,
    engine: Arc<SyncEngine>,
    status_rx: watch::Receiver<StatusSnapshot>,
    port: u16,
) -> Result<(), LoopSyncError> {
    let state = AppState { engine, status_rx };

    let app = Router::new()
        .route("/api/status", get(status))
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/settings", post(post_config))
        .route("/api/mode", post(post_mode))
        .route("/api/preload", post(preload))
        .route("/api/start", post(start))
        .route("/api/pause", post(pause))
        .route("/api/resync", post(resync))
        .route("/api/reset-clock", post(reset_clock))
        .route("/ws", get(ws_upgrade))
        .fallback_service(ServeDir::new("ui"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Listening on 0.0.0.0:{port} …");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Control surface up at http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { subsys.on_shutdown_requested().await })
        .await?;

    Ok(())
}

fn ok_envelope(value: Value) -> ApiResult<Json<Value>> {
    let mut value = value;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("ok".to_owned(), json!(true));
            Ok(Json(value))
        }
        None => Err(ApiError::Internal("response is not an object".to_owned())),
    }
}

fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> ApiResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let snapshot = state.status_rx.borrow().clone();
    let value = serde_json::to_value(&snapshot)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    ok_envelope(value)
}

async fn get_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let config = state.engine.config().await;
    let value = serde_json::to_value(&config).map_err(|e| ApiError::Internal(e.to_string()))?;
    ok_envelope(value)
}

#[instrument(skip(state, body))]
async fn post_config(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let patch: ConfigPatch = parse_body(&body)?;
    state.engine.update_config(patch).await?;
    ok_envelope(json!({}))
}

#[derive(Debug, Default, Deserialize)]
struct ModeRequest {
    #[serde(default)]
    mode: String,
}

#[instrument(skip(state, body))]
async fn post_mode(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let request: ModeRequest = parse_body(&body)?;
    let Some(mode) = Mode::parse(&request.mode) else {
        return Err(ApiError::BadRequest(format!(
            "invalid mode {:?}, expected one of off, manual, auto",
            request.mode
        )));
    };
    state.engine.set_mode(mode).await;
    ok_envelope(json!({}))
}

async fn preload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.preload_all().await?;
    ok_envelope(json!({}))
}

async fn start(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.start_all().await?;
    ok_envelope(json!({}))
}

async fn pause(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.pause_all().await?;
    ok_envelope(json!({}))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResyncRequest {
    mode: Option<crate::config::ResyncMode>,
    frame: Option<Frames>,
}

#[instrument(skip(state, body))]
async fn resync(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let request: ResyncRequest = parse_body(&body)?;
    state.engine.resync_all(request.mode, request.frame).await?;
    ok_envelope(json!({}))
}

async fn reset_clock(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.engine.reset_clock().await;
    ok_envelope(json!({}))
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws_feed(socket, state.status_rx.clone()))
}

/// Pushes the current snapshot on connect, then one message per published
/// update. Inbound messages are ignored.
async fn ws_feed(mut socket: WebSocket, mut status_rx: watch::Receiver<StatusSnapshot>) {
    debug!("Status WebSocket client connected.");
    loop {
        let snapshot = status_rx.borrow_and_update().clone();
        let Ok(json) = serde_json::to_string(&snapshot) else {
            break;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
        select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            },
            msg = socket.recv() => {
                match msg {
                    None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            },
        }
    }
    debug!("Status WebSocket client disconnected.");
}
