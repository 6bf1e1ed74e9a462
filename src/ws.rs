//! WebSocket endpoint wiring.
//!
//! One axum router exposes `/health`, the primary session endpoint `/ws`,
//! and per-route link endpoints `/ws/{route}`. Each accepted connection gets
//! a monotonic id, an outbound frame channel drained by a writer task, and a
//! cancellation token: cancelling the token is how the broker force-closes a
//! connection from anywhere.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::{ClientHandle, SessionHub};
use crate::{AppError, Result};

/// Per-server context: the session hub plus the connection id counter.
///
/// Passed by `Arc` through axum state — nothing here is process-global.
pub struct ServerContext {
    /// Broker handle shared with the runner and route handlers.
    pub hub: SessionHub,
    next_client_id: AtomicU64,
}

impl ServerContext {
    /// Build the context around an existing hub.
    #[must_use]
    pub fn new(hub: SessionHub) -> Self {
        Self {
            hub,
            next_client_id: AtomicU64::new(0),
        }
    }

    /// Allocate the next monotonic connection id.
    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Handler for `GET /health` — returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Build the application router.
#[must_use]
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(primary_upgrade))
        .route("/ws/{route}", get(link_upgrade))
        .with_state(ctx)
}

/// Bind and serve until `cancel` fires.
///
/// # Errors
///
/// Returns [`AppError::Config`] when the port cannot be bound and
/// [`AppError::Io`] on fatal accept-loop failures.
pub async fn serve(ctx: Arc<ServerContext>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "websocket server listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|err| AppError::Io(err.to_string()))
}

async fn primary_upgrade(
    State(ctx): State<Arc<ServerContext>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| primary_connection(ctx, socket))
}

async fn link_upgrade(
    State(ctx): State<Arc<ServerContext>>,
    Path(route): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| link_connection(ctx, route, socket))
}

/// Spawn the writer task draining outbound frames into the socket sink.
fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    })
}

async fn primary_connection(ctx: Arc<ServerContext>, socket: WebSocket) {
    let id = ctx.next_client_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = ClientHandle::new(id, tx, cancel.clone());

    debug!(client_id = id, "primary connection opened");
    ctx.hub.attach_primary(handle).await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx, cancel.clone());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    ctx.hub.receive_frame(id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client_id = id, %err, "primary socket error");
                    break;
                }
            }
        }
    }

    ctx.hub.detach_primary(id).await;
    cancel.cancel();
    let _ = writer.await;
    debug!(client_id = id, "primary connection closed");
}

async fn link_connection(ctx: Arc<ServerContext>, route: String, socket: WebSocket) {
    let id = ctx.next_client_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = ClientHandle::new(id, tx, cancel.clone());

    debug!(client_id = id, route, "link connection opened");
    ctx.hub.attach_link(&route, handle).await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx, cancel.clone());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    ctx.hub.receive_link_message(id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client_id = id, %err, "link socket error");
                    break;
                }
            }
        }
    }

    ctx.hub.detach_link(id).await;
    cancel.cancel();
    let _ = writer.await;
    debug!(client_id = id, route, "link connection closed");
}
