use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bridge_core::ids::ConnectionId;
use bridge_core::pipeline::Pipeline;
use bridge_telemetry::StructuredLogger;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable, Aborted};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::connection::{Connection, WsConnection};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionContext};
use crate::shutdown::ShutdownCoordinator;

/// Running session tasks, so shutdown can abort the ones that outlive it.
#[derive(Clone, Debug, Default)]
pub struct SessionTasks {
    tracker: TaskTracker,
    aborts: Arc<DashMap<ConnectionId, AbortHandle>>,
}

impl SessionTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive `session` to completion, abortable through [`abort_all`](Self::abort_all).
    pub async fn run<C: Connection>(&self, session: Session<C>) {
        let id = session.connection_id().clone();
        let (handle, registration) = AbortHandle::new_pair();
        self.aborts.insert(id.clone(), handle);
        let result = self
            .tracker
            .track_future(Abortable::new(session.run(), registration))
            .await;
        self.aborts.remove(&id);
        match result {
            Ok(report) => tracing::debug!(
                connection_id = %id,
                frames = report.frames_received,
                invocations = report.invocations,
                reason = report.close_reason.as_str(),
                "session ended"
            ),
            Err(Aborted) => tracing::warn!(connection_id = %id, "session aborted"),
        }
    }

    /// Number of session tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Abort every running session task. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.aborts.iter() {
            entry.value().abort();
            count += 1;
        }
        count
    }

    /// Stop accepting new work and wait for every task to finish.
    async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: SessionContext,
    pub sessions: SessionTasks,
    pub started: Instant,
    pub max_message_size: usize,
}

impl AppState {
    /// State for a fresh server. Sessions start untracked.
    pub fn new(ctx: SessionContext, max_message_size: usize) -> Self {
        Self {
            ctx,
            sessions: SessionTasks::new(),
            started: Instant::now(),
            max_message_size,
        }
    }
}

/// Build the axum router: `/ws` upgrades to a session, `/health` reports liveness.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    pipeline: Arc<dyn Pipeline>,
    logger: StructuredLogger,
) -> Result<ServerHandle, std::io::Error> {
    let coordinator = ShutdownCoordinator::new();
    let registry = Arc::new(SessionRegistry::new());
    let ctx = SessionContext::new(pipeline, logger, Arc::clone(&registry), coordinator.token());
    let state = AppState::new(ctx, config.max_message_size);
    let sessions = state.sessions.clone();

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "bridge server listening");

    let router = build_router(state);
    let token = coordinator.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        coordinator,
        registry,
        sessions,
        shutdown_timeout: config.shutdown_timeout,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    registry: Arc<SessionRegistry>,
    sessions: SessionTasks,
    shutdown_timeout: Duration,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port, useful after binding port 0.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sessions currently registered.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Registry of live sessions, shared with every session task.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Running session tasks.
    pub fn sessions(&self) -> &SessionTasks {
        &self.sessions
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Stop accepting, cancel every session and wait for teardown.
    ///
    /// Sessions still running when the configured timeout elapses are
    /// aborted; each writes a `session.close` record with reason `aborted`
    /// as it drops. Returns `false` in that case.
    pub async fn shutdown(self) -> bool {
        let sessions = self.sessions.clone();
        let drain = tokio::spawn(async move { sessions.close_and_wait().await });
        let drained = self
            .coordinator
            .graceful_shutdown(vec![self.server, drain], Some(self.shutdown_timeout))
            .await;
        if !drained {
            let aborted = self.sessions.abort_all();
            tracing::warn!(aborted, "aborted sessions that outlived shutdown");
        }
        drained
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let AppState {
        ctx,
        sessions,
        max_message_size,
        ..
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, ctx, sessions))
}

async fn handle_socket(socket: WebSocket, ctx: SessionContext, sessions: SessionTasks) {
    let session = Session::accept(WsConnection::new(socket), ctx);
    sessions.run(session).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "sessions": state.ctx.registry.len(),
    }))
}
