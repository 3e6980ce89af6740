//! JSON control API.  Every mutating route forwards a [`Command`] to the core
//! and answers with the resulting grid state.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use multiview_proto::protocol::{Command, GridState, StreamDescriptor, TileSnapshot};
use multiview_proto::state::GridStateStore;

use crate::core::{CommandError, GridEvent};

#[derive(Clone)]
pub struct HttpState {
    store: Arc<GridStateStore>,
    event_tx: mpsc::Sender<GridEvent>,
}

#[derive(Deserialize)]
struct StreamBody {
    #[serde(default)]
    title: String,
    url: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable,
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::NotFound(_) => ApiError::NotFound(e.to_string()),
            CommandError::Invalid(_) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "daemon is shutting down".to_string(),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl HttpState {
    async fn request(&self, command: Command) -> Result<Option<StreamDescriptor>, ApiError> {
        let (reply, answer) = oneshot::channel();
        self.event_tx
            .send(GridEvent::Request { command, reply })
            .await
            .map_err(|_| ApiError::Unavailable)?;
        let outcome = answer.await.map_err(|_| ApiError::Unavailable)?;
        Ok(outcome?)
    }

    async fn request_state(&self, command: Command) -> Result<Json<GridState>, ApiError> {
        self.request(command).await?;
        Ok(Json(self.store.get_state().await))
    }
}

pub fn router(store: Arc<GridStateStore>, event_tx: mpsc::Sender<GridEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/tiles", get(get_tiles))
        .route("/api/streams", get(list_streams).post(add_stream))
        .route("/api/streams/import", post(import_streams))
        .route("/api/streams/:id", put(update_stream).delete(remove_stream))
        .route("/api/playback/toggle", post(toggle_playback))
        .route("/api/mute/toggle", post(toggle_mute))
        .route("/api/mute/:on", post(set_mute))
        .route("/api/grid/:rows/:columns", post(set_grid))
        .route("/api/tiles/:idx/reattach", post(reattach_tile))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { store, event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    store: Arc<GridStateStore>,
    event_tx: mpsc::Sender<GridEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP API {}: {}", addr, e);
                return;
            }
        };
        info!("HTTP API listening at http://{}", addr);
        if let Err(e) = axum::serve(listener, router(store, event_tx)).await {
            error!("HTTP API stopped: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<GridState> {
    Json(state.store.get_state().await)
}

async fn get_tiles(State(state): State<HttpState>) -> Json<Vec<TileSnapshot>> {
    Json(state.store.get_state().await.tiles)
}

async fn list_streams(State(state): State<HttpState>) -> Json<Vec<StreamDescriptor>> {
    Json(state.store.get_state().await.streams)
}

async fn add_stream(
    State(state): State<HttpState>,
    Json(body): Json<StreamBody>,
) -> Result<(StatusCode, Json<StreamDescriptor>), ApiError> {
    let created = state
        .request(Command::AddStream {
            title: body.title,
            url: body.url,
        })
        .await?
        .ok_or(ApiError::Unavailable)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_stream(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(body): Json<StreamBody>,
) -> Result<Json<GridState>, ApiError> {
    let stream = StreamDescriptor {
        id,
        title: body.title,
        url: body.url,
    };
    state.request_state(Command::UpdateStream { stream }).await
}

async fn remove_stream(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::RemoveStream { id }).await
}

async fn import_streams(
    State(state): State<HttpState>,
    Json(streams): Json<Vec<StreamDescriptor>>,
) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::ImportStreams { streams }).await
}

async fn toggle_playback(State(state): State<HttpState>) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::TogglePlayback).await
}

async fn toggle_mute(State(state): State<HttpState>) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::ToggleMute).await
}

async fn set_mute(
    State(state): State<HttpState>,
    Path(on): Path<bool>,
) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::SetMute { muted: on }).await
}

async fn set_grid(
    State(state): State<HttpState>,
    Path((rows, columns)): Path<(u16, u16)>,
) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::SetGrid { rows, columns }).await
}

async fn reattach_tile(
    State(state): State<HttpState>,
    Path(idx): Path<usize>,
) -> Result<Json<GridState>, ApiError> {
    state.request_state(Command::Reattach { tile: idx }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommandResult;
    use axum::body::{self, Body};
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::util::ServiceExt;

    /// Stand-in core: records commands and answers with `respond`.
    fn fake_core(
        respond: impl Fn(&Command) -> CommandResult + Send + 'static,
    ) -> (Router, Arc<Mutex<Vec<Command>>>) {
        let store = Arc::new(GridStateStore::new(2, 2, false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel::<GridEvent>(8);
        let log = seen.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let GridEvent::Request { command, reply } = event {
                    let result = respond(&command);
                    log.lock().unwrap().push(command);
                    let _ = reply.send(result);
                }
            }
        });
        (router(store, tx), seen)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn state_and_tiles_are_served_from_the_store() {
        let (app, seen) = fake_core(|_| Ok(None));
        let (status, bytes) = call(&app, "GET", "/api/state", None).await;
        assert_eq!(status, StatusCode::OK);
        let state: GridState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!((state.rows, state.columns), (2, 2));

        let (status, bytes) = call(&app, "GET", "/api/tiles", None).await;
        assert_eq!(status, StatusCode::OK);
        let tiles: Vec<TileSnapshot> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tiles.len(), 4);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn routes_map_onto_commands() {
        let (app, seen) = fake_core(|_| Ok(None));
        assert_eq!(call(&app, "POST", "/api/mute/true", None).await.0, StatusCode::OK);
        assert_eq!(call(&app, "POST", "/api/playback/toggle", None).await.0, StatusCode::OK);
        assert_eq!(call(&app, "POST", "/api/grid/3/4", None).await.0, StatusCode::OK);
        assert_eq!(call(&app, "POST", "/api/tiles/2/reattach", None).await.0, StatusCode::OK);
        assert_eq!(call(&app, "DELETE", "/api/streams/17", None).await.0, StatusCode::OK);
        let body = r#"{"title":"Renamed","url":"https://example.com/a.m3u8"}"#;
        assert_eq!(call(&app, "PUT", "/api/streams/17", Some(body)).await.0, StatusCode::OK);

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], Command::SetMute { muted: true }));
        assert!(matches!(seen[1], Command::TogglePlayback));
        assert!(matches!(seen[2], Command::SetGrid { rows: 3, columns: 4 }));
        assert!(matches!(seen[3], Command::Reattach { tile: 2 }));
        assert!(matches!(&seen[4], Command::RemoveStream { id } if id == "17"));
        assert!(matches!(&seen[5], Command::UpdateStream { stream } if stream.title == "Renamed"));
    }

    #[tokio::test]
    async fn add_stream_returns_created_descriptor() {
        let (app, _seen) = fake_core(|cmd| match cmd {
            Command::AddStream { title, url } => Ok(Some(StreamDescriptor {
                id: "1700000000000".into(),
                title: title.clone(),
                url: url.clone(),
            })),
            _ => Ok(None),
        });
        let body = r#"{"title":"News","url":"https://example.com/news.m3u8"}"#;
        let (status, bytes) = call(&app, "POST", "/api/streams", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: StreamDescriptor = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created.title, "News");
    }

    #[tokio::test]
    async fn command_errors_map_to_status_codes() {
        let (app, _seen) = fake_core(|cmd| match cmd {
            Command::Reattach { tile } => Err(CommandError::NotFound(format!("tile {}", tile))),
            _ => Err(CommandError::Invalid("nope".into())),
        });
        let (status, bytes) = call(&app, "POST", "/api/tiles/9/reattach", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(String::from_utf8_lossy(&bytes).contains("tile 9 not found"));
        assert_eq!(call(&app, "POST", "/api/grid/0/0", None).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn closed_core_is_unavailable() {
        let store = Arc::new(GridStateStore::new(1, 1, false));
        let (tx, rx) = mpsc::channel::<GridEvent>(1);
        drop(rx);
        let app = router(store, tx);
        assert_eq!(
            call(&app, "POST", "/api/mute/toggle", None).await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
