use crate::ai_sdk::{CompletionService, OpenAiClient};
use crate::config::SettingsStore;
use crate::events::EventSink;
use crate::lifecycle::{follow_settings, Coordinator};
use crate::protocol::{Command, ConnectionCreateResponse, ServerMessage};
use crate::repo_source::{GitCli, RepoSource};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SETTINGS_POLL: Duration = Duration::from_secs(2);

pub struct ServerConfig {
    pub listen: String,
    pub clone_root: PathBuf,
    pub settings_path: PathBuf,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

struct ServerState {
    completion: watch::Receiver<Arc<dyn CompletionService>>,
    source: Arc<dyn RepoSource>,
    clone_root: PathBuf,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

/// One attached panel.
struct Connection {
    coordinator: Arc<Coordinator>,
    sink: EventSink,
    /// Taken by the first event stream.
    events: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
}

pub type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let store = Arc::new(SettingsStore::open(&config.settings_path)?);
    if config.base_url.is_some() || config.api_key.is_some() {
        store.update(|settings| {
            if let Some(base_url) = config.base_url {
                settings.client_options.base_url = base_url;
            }
            if let Some(api_key) = config.api_key {
                settings.client_options.api_key = api_key;
            }
        })?;
    }

    let settings = store.get();
    let client: Arc<dyn CompletionService> = Arc::new(OpenAiClient::new(&settings.client_options));
    let (completion_tx, completion_rx) = watch::channel(client);
    tokio::spawn(follow_settings(store.subscribe(), completion_tx));
    tokio::spawn(poll_settings(Arc::clone(&store)));

    let state = Arc::new(ServerState::new(
        completion_rx,
        Arc::new(GitCli::default()),
        config.clone_root.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(
        listen = %config.listen,
        base_url = %settings.client_options.base_url,
        clone_root = %config.clone_root.display(),
        settings = %config.settings_path.display(),
        "repochat coordinator listening"
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}

impl ServerState {
    fn new(
        completion: watch::Receiver<Arc<dyn CompletionService>>,
        source: Arc<dyn RepoSource>,
        clone_root: PathBuf,
    ) -> Self {
        Self {
            completion,
            source,
            clone_root,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, id: &str) -> Result<Arc<Connection>, StatusCode> {
        let connections = self.connections.lock().await;
        connections.get(id).cloned().ok_or(StatusCode::NOT_FOUND)
    }

    /// Forgets the connection and cancels its requests. False if it was already gone.
    async fn close(&self, id: &str) -> bool {
        let removed = self.connections.lock().await.remove(id);
        match removed {
            Some(connection) => {
                connection.coordinator.abort_all().await;
                true
            }
            None => false,
        }
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/connections", post(create_connection))
        .route("/connections/:id", delete(close_connection))
        .route("/connections/:id/events", get(stream_events))
        .route("/connections/:id/commands", post(send_command))
        .with_state(state)
}

/// Picks up edits made to the settings file by other processes.
async fn poll_settings(store: Arc<SettingsStore>) {
    let mut ticker = tokio::time::interval(SETTINGS_POLL);
    loop {
        ticker.tick().await;
        if let Err(err) = store.reload() {
            warn!(error = %err, "Failed to reload settings");
        }
    }
}

async fn create_connection(
    State(state): State<Arc<ServerState>>,
) -> Json<ConnectionCreateResponse> {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, events) = EventSink::channel();
    let coordinator = Coordinator::new(
        state.completion.clone(),
        Arc::clone(&state.source),
        state.clone_root.clone(),
    );
    let connection = Arc::new(Connection {
        coordinator: Arc::new(coordinator),
        sink,
        events: Mutex::new(Some(events)),
    });

    state
        .connections
        .lock()
        .await
        .insert(connection_id.clone(), connection);
    info!(%connection_id, "Panel connected");

    Json(ConnectionCreateResponse { connection_id })
}

async fn close_connection(
    State(state): State<Arc<ServerState>>,
    Path(connection_id): Path<String>,
) -> StatusCode {
    if state.close(&connection_id).await {
        info!(%connection_id, "Panel disconnected");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// A panel that goes away without saying so is closed once its event stream is dropped.
async fn close_on_detach(
    state: Arc<ServerState>,
    connection_id: String,
    detached: CancellationToken,
) {
    detached.cancelled().await;
    if state.close(&connection_id).await {
        info!(%connection_id, "Event stream dropped, closing connection");
    }
}

async fn send_command(
    State(state): State<Arc<ServerState>>,
    Path(connection_id): Path<String>,
    Json(command): Json<Command>,
) -> Result<StatusCode, StatusCode> {
    let connection = state.connection(&connection_id).await?;
    debug!(%connection_id, ?command, "Received command");
    connection
        .coordinator
        .handle(command, connection.sink.clone())
        .await;
    Ok(StatusCode::ACCEPTED)
}

async fn stream_events(
    State(state): State<Arc<ServerState>>,
    Path(connection_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let connection = state.connection(&connection_id).await?;
    let events = connection
        .events
        .lock()
        .await
        .take()
        .ok_or(StatusCode::CONFLICT)?;
    debug!(%connection_id, "Event stream attached");

    let detached = CancellationToken::new();
    tokio::spawn(close_on_detach(
        Arc::clone(&state),
        connection_id,
        detached.clone(),
    ));
    let guard = detached.drop_guard();

    let stream = UnboundedReceiverStream::new(events).map(move |message| {
        let _attached = &guard;
        let data = serde_json::to_string(&message).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
