use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use echohub_core::messages::{ChatFrame, ErrorFrame};
use echohub_core::{HubError, Identity};

use crate::protocol::ProtocolHandler;
use crate::registry::{ConnectionId, ConnectionRegistry, Member, Outbound};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared pieces every connection task needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub protocol: Arc<ProtocolHandler>,
    pub shutdown: CancellationToken,
    pub max_send_queue: usize,
    pub max_frame_bytes: usize,
}

/// Unregisters the connection however the serving task ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

/// Serve an authenticated WebSocket until either side goes away, the
/// dispatcher evicts it, or the server shuts down.
pub async fn serve_connection(socket: WebSocket, identity: Identity, ctx: ConnectionContext) {
    let (tx, rx) = mpsc::channel::<Outbound>(ctx.max_send_queue.max(1));
    let close = ctx.shutdown.child_token();
    let member = Member::new(identity.clone(), tx.clone(), close.clone());
    let conn_id = member.id.clone();

    let span = tracing::info_span!("connection", user_id = identity.id.get(), conn_id = %conn_id);
    async move {
        let _registration = Registration {
            registry: Arc::clone(&ctx.registry),
            id: ctx.registry.register(member),
        };
        info!(connections = ctx.registry.count(), "connection opened");

        let (ws_tx, mut ws_rx) = socket.split();
        let writer = tokio::spawn(write_loop(ws_tx, rx, close.clone()).in_current_span());

        let reason = loop {
            let next = tokio::select! {
                _ = close.cancelled() => break "closed by server",
                next = ws_rx.next() => next,
            };
            let frame = match next {
                Some(Ok(WsMessage::Text(text))) => decode(text.as_bytes(), ctx.max_frame_bytes),
                Some(Ok(WsMessage::Binary(bytes))) => decode(&bytes, ctx.max_frame_bytes),
                Some(Ok(WsMessage::Close(_))) | None => break "closed by peer",
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break "read error";
                }
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "closing connection on undecodable frame");
                    break "undecodable frame";
                }
            };
            if let Err(e) = ctx.protocol.handle(&identity, frame, &tx).await {
                warn!(error_kind = e.error_kind(), error = %e, "closing connection");
                break "fatal error";
            }
        };

        close.cancel();
        if let Err(e) = writer.await {
            warn!(error = %e, "writer task panicked");
        }
        info!(reason, "connection closed");
    }
    .instrument(span)
    .await
}

fn decode(raw: &[u8], max_frame_bytes: usize) -> Result<ChatFrame, HubError> {
    if raw.len() > max_frame_bytes {
        return Err(HubError::Transport(format!(
            "frame of {} bytes exceeds limit of {max_frame_bytes}",
            raw.len()
        )));
    }
    serde_json::from_slice(raw).map_err(|e| HubError::Transport(format!("malformed frame: {e}")))
}

/// Forward queued frames to the socket, with a periodic ping. Stops on
/// close, on a failed write, or once every queue sender is gone.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    close: CancellationToken,
) {
    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break,
            next = rx.recv() => match next {
                Some(text) => {
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.to_string().into())).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                tracing::trace!("sent ping");
            }
        }
    }

    close.cancel();
    let _ = ws_tx.send(WsMessage::Close(None)).await;
}

/// Tell an unauthenticated client why it is being dropped, then close.
pub async fn reject_unauthorized(mut socket: WebSocket) {
    match ErrorFrame::unauthorized().to_json() {
        Ok(json) => {
            let _ = socket.send(WsMessage::Text(json.into())).await;
        }
        Err(e) => warn!(error = %e, "failed to encode unauthorized frame"),
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}
