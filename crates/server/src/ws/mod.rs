// WebSocket transport: one socket per connection, one pipeline worker per
// socket.
//
// The reader loop answers protocol rejects itself and forwards valid
// envelopes to the worker, which runs them strictly one at a time. Every
// frame for the client, including live notifications from other
// connections, goes through the connection's outbox.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bittle_common::protocol::{parse_envelope, Envelope, Outbound, Reject, Rejected};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::Accounts;
use crate::config::ServerConfig;
use crate::pipeline::Pipeline;
use crate::repo::RepoRegistry;
use crate::session::Session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Clone)]
pub struct AppState {
    pub repos: RepoRegistry,
    pub accounts: Accounts,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| {
            let conn_id = Uuid::new_v4();
            let span = info_span!("connection", conn_id = %conn_id, peer = %peer);
            handle_socket(state, conn_id, peer, socket).instrument(span)
        })
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket, max_frame_bytes: usize) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {max_frame_bytes} bytes").into(),
        })))
        .await;
}

async fn send_outbound(socket: &mut WebSocket, frame: &Outbound) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(error) => {
            error!(error = %error, "outbound frame did not serialize");
            Ok(())
        }
    }
}

fn reject_frame(rejected: Rejected) -> Outbound {
    Outbound::Reject(Reject::new(
        rejected.reason.to_string(),
        rejected.data,
        Utc::now().timestamp_millis(),
    ))
}

/// Run queued requests one at a time until the socket closes. Requests
/// still queued at that point are abandoned; the one in flight completes.
fn spawn_worker(
    mut pipeline: Pipeline,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    mut closed: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    next = queue.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let outbox = pipeline.session().outbox().clone();
                for frame in pipeline.process(envelope).await {
                    if outbox.send(Outbound::Response(frame)).is_err() {
                        break;
                    }
                }
            }

            pipeline.session_mut().disconnect().await;
        }
        .in_current_span(),
    )
}

async fn handle_socket(state: AppState, conn_id: Uuid, peer: SocketAddr, mut socket: WebSocket) {
    let max_frame_bytes = state.config.max_frame_bytes;
    info!("connection opened");

    let (outbox, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let session = Session::new(
        conn_id,
        peer.to_string(),
        outbox.clone(),
        state.accounts.clone(),
        state.repos.clone(),
    );
    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Envelope>();
    let (close_tx, close_rx) = oneshot::channel::<()>();
    let worker = spawn_worker(Pipeline::new(session, state.config.request_timeout), queue_rx, close_rx);

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!("heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                let Some(frame) = maybe_outbound else {
                    break;
                };
                if send_outbound(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                let raw = match message {
                    Ok(Message::Text(raw)) => raw.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        continue;
                    }
                    Ok(Message::Ping(_)) => continue,
                    Ok(Message::Close(_)) => break,
                    Err(error) if is_frame_size_violation(&error) => {
                        close_frame_too_large(&mut socket, max_frame_bytes).await;
                        break;
                    }
                    Err(error) => {
                        debug!(error = %error, "websocket receive failed");
                        break;
                    }
                };

                if raw.len() > max_frame_bytes {
                    close_frame_too_large(&mut socket, max_frame_bytes).await;
                    break;
                }

                match parse_envelope(&raw) {
                    Ok(envelope) => {
                        debug!(op = %envelope.id, "request queued");
                        if queue_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(rejected) => {
                        debug!(reason = %rejected.reason, "frame rejected");
                        if send_outbound(&mut socket, &reject_frame(rejected)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(close_tx);
    drop(queue_tx);
    if let Err(join_error) = worker.await {
        error!(?join_error, "connection worker failed");
    }
    info!("connection closed");
}
