//! The broker's network surface.
//!
//! Two websocket endpoints, one session task per upgraded connection. The
//! listener stops on the shutdown signal; sessions still running get
//! [`ServerConfig::grace`] to finish before they are cancelled.

use crate::attest::AttestationProvider;
use crate::channel::ws::ServerSocket;
use crate::channel::Timeouts;
use crate::session::{Flow, RetryPolicy, SessionHandler, SessionHeaders};
use crate::store::RecordStore;
use crate::volume::PartitionDescriptor;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const GET_PASS: &str = "/getPass";
pub const POST_PASS: &str = "/postPass";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ServerError> = core::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Scope of the volume records and secrets this broker serves.
    pub namespace: String,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    /// How long in-flight sessions may run after shutdown is requested.
    pub grace: Duration,
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8082)),
            namespace: "default".into(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            grace: Duration::from_secs(30),
            max_frame: 64 * 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    handler: Arc<SessionHandler>,
    timeouts: Timeouts,
    max_frame: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        attestor: Arc<dyn AttestationProvider>,
    ) -> Self {
        let handler =
            SessionHandler::new(store, attestor, config.namespace.clone()).with_retry(config.retry);
        let state = AppState {
            handler: Arc::new(handler),
            timeouts: config.timeouts,
            max_frame: config.max_frame,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        };
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(GET_PASS, get(get_pass))
            .route(POST_PASS, get(post_pass))
            .with_state(self.state.clone())
    }

    /// Binds [`ServerConfig::listen`] and serves until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, namespace = %self.config.namespace, "keyserver listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        let tracker = &self.state.tracker;
        tracker.close();
        info!(sessions = tracker.len(), "listener closed, draining sessions");
        if tokio::time::timeout(self.config.grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                sessions = tracker.len(),
                "grace period elapsed, cancelling sessions"
            );
            self.state.cancel.cancel();
            tracker.wait().await;
        }
        info!("keyserver stopped");
        Ok(())
    }
}

fn header(headers: &HeaderMap, name: impl axum::http::header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn session_headers(headers: &HeaderMap) -> SessionHeaders {
    SessionHeaders {
        token: header(headers, AUTHORIZATION),
        descriptor: PartitionDescriptor {
            label: header(headers, "label"),
            name: header(headers, "name"),
            uuid: header(headers, "uuid"),
        },
    }
}

async fn get_pass(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.upgrade(Flow::Get, &headers, ws)
}

async fn post_pass(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.upgrade(Flow::Post, &headers, ws)
}

impl AppState {
    fn upgrade(self, flow: Flow, headers: &HeaderMap, ws: WebSocketUpgrade) -> Response {
        let headers = session_headers(headers);
        ws.max_message_size(self.max_frame)
            .on_upgrade(move |socket| self.run(flow, headers, socket))
    }

    async fn run(self, flow: Flow, headers: SessionHeaders, socket: WebSocket) {
        let id = Uuid::new_v4();
        let mut channel = ServerSocket::new(socket, self.timeouts);
        let handler = self.handler.clone();

        let session = async move {
            info!(session = %id, %flow, "session started");
            let outcome = match flow {
                Flow::Get => handler
                    .get_pass(id, &headers, &mut channel)
                    .await
                    .map(|o| format!("{o:?}")),
                Flow::Post => handler
                    .post_pass(id, &headers, &mut channel)
                    .await
                    .map(|o| format!("{o:?}")),
            };
            match outcome {
                Ok(outcome) => info!(session = %id, %flow, %outcome, "session ended"),
                Err(e) => warn!(session = %id, %flow, error = %e, "session failed"),
            }
        };

        let cancel = self.cancel.clone();
        self.tracker
            .track_future(
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            warn!(session = %id, %flow, "session cancelled by shutdown")
                        }
                        _ = session => {}
                    }
                }
                .instrument(info_span!("session", session = %id, %flow)),
            )
            .await
    }
}
