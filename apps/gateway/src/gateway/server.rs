//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::middleware::{bearer_token, ClientIp};
use crate::auth::Identity;
use crate::error::ApiError;
use crate::ratelimit::{Caller, RouteClass};
use crate::AppState;

use super::connection::{CloseSignal, CLOSE_INVALID_FRAME, CLOSE_NORMAL};
use super::handler::{handle_frame, Flow};

/// How long the writer gets to flush a close frame before it is aborted.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

/// Rate-limit by IP, then authenticate, then upgrade. Rejected requests never
/// reach the WebSocket layer.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(info) = state.limiter.check(&Caller::Ip(ip.clone()), RouteClass::Connect) {
        tracing::info!(%ip, retry_after = info.retry_after_secs, "gateway connect rate limited");
        return ApiError::rate_limited(info).into_response();
    }

    let token = params
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let Some(token) = token else {
        return ApiError::unauthorized("Missing session token").into_response();
    };

    let identity = match state.validator.validate(&token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            tracing::debug!(%ip, "gateway connect with invalid token");
            return ApiError::unauthorized("Invalid or expired session token").into_response();
        }
        Err(err) => return ApiError::from(err).into_response(),
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
}

/// Run one authenticated connection until the client leaves, the read side
/// fails, or the connection is closed from elsewhere (eviction, slow
/// consumer).
pub async fn handle_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.outbound_buffer);

    let conn = state.registry.register(identity, tx);
    state.listener.start();

    let mut writer = tokio::spawn(write_loop(ws_tx, rx, conn.close_signal()));

    tracing::info!(
        user_id = %conn.user_id(),
        connection = %conn.id(),
        "gateway session established"
    );

    loop {
        tokio::select! {
            _ = conn.closed() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&state, &conn, text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        conn.close(CLOSE_INVALID_FRAME, "Binary frames are not supported");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(user_id = %conn.user_id(), error = %err, "ws read error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.release(&conn);
    conn.close(CLOSE_NORMAL, "session ended");
    if time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!(
        user_id = %conn.user_id(),
        connection = %conn.id(),
        "gateway session ended"
    );
}

/// Drain the outbound queue into the socket. Stops after a close frame or
/// on the first write error, which also closes the connection.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    signal: std::sync::Arc<CloseSignal>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(err) = ws_tx.send(msg).await {
            tracing::debug!(error = %err, "ws write failed");
            signal.close();
            return;
        }
        if closing {
            return;
        }
    }
}
