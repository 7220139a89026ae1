/**
 * API REST/WS VIGIE - Couche boundary du kernel
 *
 * RÔLE :
 * Adapter les contrats fonction des moteurs (fan-out, logs, stats,
 * terminal, alertes, reconciliation) en HTTP/WebSocket. Aucune logique
 * métier ici : marshaling et signalisation transport uniquement.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key (x-api-key)
 * - Listings agrégés : {items, errors} — un hôte mort dégrade la vue,
 *   ne la casse jamais
 * - Logs live : body HTTP streaming en NDJSON (une entrée par ligne)
 * - Stats live : WebSocket, un objet JSON par message
 * - Terminal : WebSocket, frames binaires + frame texte resize
 *
 * SÉCURITÉ :
 * - Header x-api-key exigé quand VIGIE_API_KEY est défini (/health exempt)
 */

use crate::alerts::AlertStore;
use crate::hosts::HostManager;
use crate::models::{ContainerIdentity, HostDescriptor, HostError, LogEntry};
use crate::terminal::{RemoteFrame, TerminalSession};
use crate::{logs, query, reconcile, stats};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bollard::container::{RestartContainerOptions, StopContainerOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub hosts: Arc<HostManager>,
    pub alerts: Arc<dyn AlertStore>,
    pub started_at: Instant,
}

/// Réponse des listings fan-out : succès partiels + erreurs par hôte.
#[derive(Serialize)]
struct ListResponse<T> {
    items: Vec<T>,
    errors: Vec<HostError>,
}

#[derive(Serialize)]
struct KernelHealth {
    uptime_seconds: u64,
    hosts_connected: usize,
    alerts_unacknowledged: usize,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("VIGIE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        // mode ouvert : aucune clé configurée
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{host}/stats", get(get_host_stats))
        .route("/containers", get(get_containers))
        .route("/images", get(get_images))
        .route("/networks", get(get_networks))
        .route("/containers/{host}/{id}/start", post(start_container))
        .route("/containers/{host}/{id}/stop", post(stop_container))
        .route("/containers/{host}/{id}/restart", post(restart_container))
        .route("/containers/{host}/{id}", delete(remove_container))
        .route("/containers/{host}/{id}/logs", get(get_logs))
        .route("/containers/{host}/{id}/logs/stream", get(stream_logs))
        .route("/containers/{host}/{id}/stats", get(get_stats))
        .route("/containers/{host}/{id}/stats/stream", get(stream_stats_ws))
        .route("/containers/{host}/{id}/terminal", get(terminal_ws))
        .route("/containers/{host}/{id}/env", post(reconcile_env))
        .route("/alerts", get(get_alerts))
        .route("/alerts/recent", get(get_recent_alerts))
        .route("/alerts/unacknowledged/count", get(get_unacknowledged_count))
        .route("/alerts/{id}/ack", post(acknowledge_alert))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn unknown_host(host: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown host: {host}") })),
    )
}

fn runtime_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": e.to_string() })),
    )
}

fn client_for(app: &AppState, host: &str) -> Result<Docker, ApiError> {
    app.hosts.client(host).ok_or_else(|| unknown_host(host))
}

// GET /system/health (état kernel)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(KernelHealth {
        uptime_seconds: app.started_at.elapsed().as_secs(),
        hosts_connected: app.hosts.len(),
        alerts_unacknowledged: app.alerts.unacknowledged_count(),
    })
}

// GET /hosts (table des hôtes connectés)
async fn get_hosts(State(app): State<AppState>) -> Json<Vec<HostDescriptor>> {
    Json(app.hosts.descriptors())
}

// GET /hosts/{host}/stats (tous les conteneurs en marche ; résultats
// partiels attendus, un conteneur sorti entre listing et lecture est sauté)
async fn get_host_stats(
    State(app): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<Vec<crate::models::ContainerStats>>, ApiError> {
    let docker = client_for(&app, &host)?;
    let snapshots = stats::all_container_stats(&docker, &host)
        .await
        .map_err(runtime_error)?;
    Ok(Json(snapshots))
}

// GET /containers (fan-out tous hôtes)
async fn get_containers(State(app): State<AppState>) -> impl IntoResponse {
    let (items, errors) = query::list_all_containers(&app.hosts.clients()).await;
    Json(ListResponse { items, errors })
}

// GET /images
async fn get_images(State(app): State<AppState>) -> impl IntoResponse {
    let (items, errors) = query::list_all_images(&app.hosts.clients()).await;
    Json(ListResponse { items, errors })
}

// GET /networks
async fn get_networks(State(app): State<AppState>) -> impl IntoResponse {
    let (items, errors) = query::list_all_networks(&app.hosts.clients()).await;
    Json(ListResponse { items, errors })
}

// POST /containers/{host}/{id}/start
async fn start_container(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let docker = client_for(&app, &host)?;
    docker
        .start_container(&id, None::<bollard::container::StartContainerOptions<String>>)
        .await
        .map_err(runtime_error)?;
    Ok(Json(json!({ "status": "started" })))
}

// POST /containers/{host}/{id}/stop
async fn stop_container(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let docker = client_for(&app, &host)?;
    docker
        .stop_container(&id, Some(StopContainerOptions { t: 10 }))
        .await
        .map_err(runtime_error)?;
    Ok(Json(json!({ "status": "stopped" })))
}

// POST /containers/{host}/{id}/restart
async fn restart_container(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let docker = client_for(&app, &host)?;
    docker
        .restart_container(&id, Some(RestartContainerOptions { t: 10 }))
        .await
        .map_err(runtime_error)?;
    Ok(Json(json!({ "status": "restarted" })))
}

// DELETE /containers/{host}/{id}
async fn remove_container(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let docker = client_for(&app, &host)?;
    docker
        .remove_container(&id, None::<bollard::container::RemoveContainerOptions>)
        .await
        .map_err(runtime_error)?;
    Ok(Json(json!({ "status": "removed" })))
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    tail: Option<usize>,
}

// GET /containers/{host}/{id}/logs (historique borné)
async fn get_logs(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let docker = client_for(&app, &host)?;
    let entries = logs::fetch_logs(&docker, &id, params.tail.unwrap_or(100))
        .await
        .map_err(runtime_error)?;
    Ok(Json(entries))
}

// GET /containers/{host}/{id}/logs/stream (NDJSON live)
async fn stream_logs(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    Query(params): Query<LogsParams>,
) -> Result<Response, ApiError> {
    let docker = client_for(&app, &host)?;
    let rx = logs::stream_logs(docker, &id, params.tail.unwrap_or(50));

    // une entrée = une ligne JSON ; la fermeture du body coupe le producteur
    let body = futures::stream::unfold(rx, |mut rx| async move {
        let entry = rx.recv().await?;
        let mut line = serde_json::to_vec(&entry).ok()?;
        line.push(b'\n');
        Some((Ok::<_, std::convert::Infallible>(Bytes::from(line)), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

// GET /containers/{host}/{id}/stats (snapshot unique)
async fn get_stats(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Result<Json<crate::models::ContainerStats>, ApiError> {
    let docker = client_for(&app, &host)?;
    let snapshot = stats::container_stats(&docker, &host, &id)
        .await
        .map_err(runtime_error)?;
    Ok(Json(snapshot))
}

// GET /containers/{host}/{id}/stats/stream (WebSocket, un JSON par message)
async fn stream_stats_ws(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Response {
    let Some(docker) = app.hosts.client(&host) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| run_stats_socket(socket, docker, host, id))
}

async fn run_stats_socket(mut socket: WebSocket, docker: Docker, host: String, id: String) {
    let mut rx = stats::stream_stats(docker, &host, &id);
    loop {
        tokio::select! {
            // fermeture côté client : drop du receiver → le producteur s'arrête
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            snapshot = rx.recv() => match snapshot {
                Some(snapshot) => {
                    let Ok(payload) = serde_json::to_string(&snapshot) else { continue };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

// GET /containers/{host}/{id}/terminal (WebSocket duplex)
async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Response {
    let Some(docker) = app.hosts.client(&host) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| run_terminal_socket(socket, docker, host, id))
}

async fn run_terminal_socket(socket: WebSocket, docker: Docker, host: String, id: String) {
    let session = match TerminalSession::open(docker, &host, &id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(host = %host, container = %id, error = %e, "terminal open failed");
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    // octets conteneur → frames binaires
    let to_remote = ws_tx.with(|bytes: Bytes| {
        std::future::ready(Ok::<_, axum::Error>(Message::Binary(bytes)))
    });
    // frames WS → RemoteFrame (texte = entrée ou contrôle resize)
    let from_remote = ws_rx.filter_map(|msg| std::future::ready(map_ws_frame(msg)));

    session.bridge(to_remote, from_remote).await;
}

fn map_ws_frame(msg: Result<Message, axum::Error>) -> Option<RemoteFrame> {
    match msg {
        Ok(Message::Binary(data)) => Some(RemoteFrame::Binary(data.to_vec())),
        Ok(Message::Text(text)) => Some(RemoteFrame::Text(text.as_str().to_string())),
        Ok(Message::Close(_)) => Some(RemoteFrame::Closed),
        Ok(_) => None, // ping/pong gérés par axum
        Err(_) => Some(RemoteFrame::Closed),
    }
}

// POST /containers/{host}/{id}/env (reconciliation, retourne la nouvelle identité)
async fn reconcile_env(
    State(app): State<AppState>,
    Path((host, id)): Path<(String, String)>,
    Json(desired): Json<HashMap<String, String>>,
) -> Result<Json<ContainerIdentity>, ApiError> {
    let docker = client_for(&app, &host)?;
    match reconcile::reconcile_env(&docker, &host, &id, desired).await {
        Ok(identity) => Ok(Json(identity)),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string(), "phase": e.phase.to_string() })),
        )),
    }
}

// GET /alerts (historique complet, plus récent en tête)
async fn get_alerts(State(app): State<AppState>) -> Json<Vec<crate::models::Alert>> {
    Json(app.alerts.get_all())
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    limit: Option<usize>,
}

// GET /alerts/recent?limit=N
async fn get_recent_alerts(
    State(app): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<crate::models::Alert>> {
    Json(app.alerts.get_recent(params.limit.unwrap_or(20)))
}

// GET /alerts/unacknowledged/count
async fn get_unacknowledged_count(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "count": app.alerts.unacknowledged_count() }))
}

// POST /alerts/{id}/ack — id inconnu = 404, jamais un succès silencieux
async fn acknowledge_alert(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if app.alerts.acknowledge(&id) {
        Ok(Json(json!({ "status": "acknowledged" })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown alert: {id}") })),
        ))
    }
}
